//! Proxy process control.
//!
//! The proxy is driven either by spawning its binary directly or by
//! exec-ing into the container it runs in. Which one is decided once at
//! startup; the reconciler only sees [`ProxyControl`].

use async_trait::async_trait;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Placeholder in command arguments replaced with the config file path.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Where the proxy runs relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Same host context, reachable by direct process invocation.
    Local,
    /// Separate container, reachable via `<runtime> exec`.
    Container,
}

impl DeploymentMode {
    /// Probe environment markers: `/.dockerenv`, a docker cgroup on pid 1,
    /// or `DOCKER_CONTAINER=true`.
    pub fn detect() -> Self {
        let dockerenv = Path::new("/.dockerenv").exists();
        let cgroup = std::fs::read_to_string("/proc/1/cgroup").ok();
        let flag = std::env::var("DOCKER_CONTAINER").ok();
        let mode = Self::from_markers(dockerenv, cgroup.as_deref(), flag.as_deref());
        info!(mode = %mode, "Detected deployment mode");
        mode
    }

    pub(crate) fn from_markers(dockerenv: bool, cgroup: Option<&str>, flag: Option<&str>) -> Self {
        if dockerenv || cgroup.is_some_and(|c| c.contains("docker")) || flag == Some("true") {
            DeploymentMode::Container
        } else {
            DeploymentMode::Local
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Local => write!(f, "local"),
            DeploymentMode::Container => write!(f, "container"),
        }
    }
}

/// Verdict of a configuration syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    /// The proxy accepted the configuration.
    Passed(String),
    /// The proxy ran and rejected the configuration.
    Rejected(String),
    /// The check could not run (binary or container missing).
    Unavailable(String),
}

/// Operations the reconciler needs from the proxy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Check the syntax of the configuration at `config_path`.
    ///
    /// `Err` is reserved for timeouts and failures to run the check that
    /// are not plain unavailability.
    async fn test_config(&self, config_path: &Path) -> Result<SyntaxCheck>;

    /// Signal the proxy to reload. Returns the command output.
    async fn reload(&self) -> Result<String>;

    /// Proxy version string.
    async fn version(&self) -> Result<String>;

    fn mode(&self) -> DeploymentMode;
}

/// Proxy binary and the arguments for each operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommands {
    pub binary: String,
    /// Occurrences of `{config}` are replaced with the config path.
    pub test_args: Vec<String>,
    pub reload_args: Vec<String>,
    pub version_args: Vec<String>,
    pub timeout: Duration,
}

impl Default for ProxyCommands {
    fn default() -> Self {
        Self {
            binary: "nginx".to_string(),
            test_args: vec!["-t".to_string()],
            reload_args: vec!["-s".to_string(), "reload".to_string()],
            version_args: vec!["-v".to_string()],
            timeout: Duration::from_secs(10),
        }
    }
}

/// Container runtime and container name for exec-style control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub runtime: String,
    pub name: String,
}

impl Default for ContainerTarget {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            name: "nginx-proxy-manager-nginx".to_string(),
        }
    }
}

/// Build the control for `mode`.
pub fn build_control(
    mode: DeploymentMode,
    commands: ProxyCommands,
    container: ContainerTarget,
) -> Arc<dyn ProxyControl> {
    match mode {
        DeploymentMode::Local => Arc::new(LocalControl::new(commands)),
        DeploymentMode::Container => Arc::new(ContainerControl::new(commands, container)),
    }
}

/// Runs the proxy binary directly.
#[derive(Debug, Clone)]
pub struct LocalControl {
    commands: ProxyCommands,
}

impl LocalControl {
    pub fn new(commands: ProxyCommands) -> Self {
        Self { commands }
    }

    fn argv(&self, args: &[String], config_path: Option<&Path>) -> (String, Vec<String>) {
        (
            self.commands.binary.clone(),
            substitute(args, config_path),
        )
    }
}

#[async_trait]
impl ProxyControl for LocalControl {
    async fn test_config(&self, config_path: &Path) -> Result<SyntaxCheck> {
        let (program, args) = self.argv(&self.commands.test_args, Some(config_path));
        syntax_check(&program, &args, self.commands.timeout, false).await
    }

    async fn reload(&self) -> Result<String> {
        let (program, args) = self.argv(&self.commands.reload_args, None);
        run_checked(&program, &args, self.commands.timeout).await
    }

    async fn version(&self) -> Result<String> {
        let (program, args) = self.argv(&self.commands.version_args, None);
        run_checked(&program, &args, self.commands.timeout).await
    }

    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Local
    }
}

/// Runs the proxy binary inside its container via `<runtime> exec`.
#[derive(Debug, Clone)]
pub struct ContainerControl {
    commands: ProxyCommands,
    target: ContainerTarget,
}

impl ContainerControl {
    pub fn new(commands: ProxyCommands, target: ContainerTarget) -> Self {
        Self { commands, target }
    }

    fn argv(&self, args: &[String], config_path: Option<&Path>) -> (String, Vec<String>) {
        let mut argv = vec![
            "exec".to_string(),
            self.target.name.clone(),
            self.commands.binary.clone(),
        ];
        argv.extend(substitute(args, config_path));
        (self.target.runtime.clone(), argv)
    }
}

#[async_trait]
impl ProxyControl for ContainerControl {
    async fn test_config(&self, config_path: &Path) -> Result<SyntaxCheck> {
        let (program, args) = self.argv(&self.commands.test_args, Some(config_path));
        syntax_check(&program, &args, self.commands.timeout, true).await
    }

    async fn reload(&self) -> Result<String> {
        let (program, args) = self.argv(&self.commands.reload_args, None);
        run_checked(&program, &args, self.commands.timeout).await
    }

    async fn version(&self) -> Result<String> {
        let (program, args) = self.argv(&self.commands.version_args, None);
        run_checked(&program, &args, self.commands.timeout).await
    }

    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Container
    }
}

fn substitute(args: &[String], config_path: Option<&Path>) -> Vec<String> {
    match config_path {
        Some(path) => {
            let path = path.display().to_string();
            args.iter()
                .map(|a| a.replace(CONFIG_PLACEHOLDER, &path))
                .collect()
        }
        None => args.to_vec(),
    }
}

#[derive(Debug)]
struct Finished {
    success: bool,
    code: Option<i32>,
    output: String,
}

#[derive(Debug)]
enum RunFailure {
    Missing(String),
    TimedOut(Duration),
    Io(String),
}

async fn run(program: &str, args: &[String], timeout: Duration) -> std::result::Result<Finished, RunFailure> {
    debug!(program, ?args, "Running proxy command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RunFailure::Missing(format!("{program} not found")));
        }
        Ok(Err(e)) => return Err(RunFailure::Io(format!("{program}: {e}"))),
        Err(_) => return Err(RunFailure::TimedOut(timeout)),
    };

    // nginx reports on stderr
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let text = match (stderr.is_empty(), stdout.is_empty()) {
        (false, false) => format!("{stderr}\n{stdout}"),
        (false, true) => stderr,
        _ => stdout,
    };

    Ok(Finished {
        success: output.status.success(),
        code: output.status.code(),
        output: text,
    })
}

async fn syntax_check(
    program: &str,
    args: &[String],
    timeout: Duration,
    via_container: bool,
) -> Result<SyntaxCheck> {
    match run(program, args, timeout).await {
        Ok(done) if done.success => Ok(SyntaxCheck::Passed(done.output)),
        Ok(done) if via_container && container_unavailable(done.code, &done.output) => {
            warn!(output = %done.output, "Proxy container unavailable for syntax check");
            Ok(SyntaxCheck::Unavailable(done.output))
        }
        Ok(done) => Ok(SyntaxCheck::Rejected(done.output)),
        Err(RunFailure::Missing(reason)) => Ok(SyntaxCheck::Unavailable(reason)),
        Err(RunFailure::TimedOut(after)) => Err(Error::timeout(format!(
            "syntax check did not finish within {after:?}"
        ))),
        Err(RunFailure::Io(reason)) => Err(Error::command(reason)),
    }
}

async fn run_checked(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    match run(program, args, timeout).await {
        Ok(done) if done.success => Ok(done.output),
        Ok(done) => Err(Error::command(match done.code {
            Some(code) => format!("{program} exited with status {code}: {}", done.output),
            None => format!("{program} terminated by signal: {}", done.output),
        })),
        Err(RunFailure::Missing(reason)) | Err(RunFailure::Io(reason)) => {
            Err(Error::command(reason))
        }
        Err(RunFailure::TimedOut(after)) => Err(Error::timeout(format!(
            "{program} did not finish within {after:?}"
        ))),
    }
}

// Runtime-level failures as opposed to the proxy rejecting its config.
fn container_unavailable(code: Option<i32>, output: &str) -> bool {
    matches!(code, Some(125..=127))
        || output.contains("No such container")
        || output.contains("is not running")
        || output.contains("Cannot connect to the Docker daemon")
}
