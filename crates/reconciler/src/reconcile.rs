//! Render, write, test, activate; roll back on failure.

use crate::control::{DeploymentMode, ProxyControl, SyntaxCheck};
use crate::render::Renderer;
use chrono::{DateTime, Utc};
use common::{Error, ErrorKind};
use rulestore::RuleSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Pipeline state of one reconcile invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Idle,
    Rendering,
    Writing,
    Testing,
    Activating,
    /// New configuration is live.
    Committed,
    /// A failure after writing; the previous configuration was restored.
    RolledBack,
    /// Failed before anything needed undoing, or the rollback itself failed.
    Aborted,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Idle => "idle",
            ReconcileState::Rendering => "rendering",
            ReconcileState::Writing => "writing",
            ReconcileState::Testing => "testing",
            ReconcileState::Activating => "activating",
            ReconcileState::Committed => "committed",
            ReconcileState::RolledBack => "rolled_back",
            ReconcileState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Failure carried by a [`ReconcileResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&Error> for FailureInfo {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            detail: err.detail(),
        }
    }
}

/// Verdict of one reconcile invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub success: bool,
    pub state: ReconcileState,
    pub message: String,
    pub config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    pub rolled_back: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Proxy environment and last reconcile outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub mode: DeploymentMode,
    pub config_path: String,
    pub config_exists: bool,
    pub template_path: String,
    pub template_exists: bool,
    pub version: Option<String>,
    pub last_reconcile: Option<ReconcileResult>,
}

/// File locations used by the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerPaths {
    pub template_path: PathBuf,
    pub config_path: PathBuf,
    /// Defaults to `<config_path>.backup`.
    pub rollback_path: Option<PathBuf>,
}

/// Tracks state transitions for one invocation.
struct Run {
    state: ReconcileState,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl Run {
    fn new() -> Self {
        Self {
            state: ReconcileState::Idle,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn enter(&mut self, next: ReconcileState) {
        debug!(from = %self.state, to = %next, "Reconcile state transition");
        self.state = next;
    }

    fn finish(
        mut self,
        state: ReconcileState,
        message: String,
        config_path: &Path,
        error: Option<&Error>,
        rolled_back: bool,
    ) -> ReconcileResult {
        self.enter(state);
        ReconcileResult {
            success: state == ReconcileState::Committed,
            state,
            message,
            config_path: config_path.display().to_string(),
            error: error.map(FailureInfo::from),
            rolled_back,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
        }
    }
}

/// Derives proxy configuration from the enabled rules and makes it live.
pub struct Reconciler {
    rules: Arc<dyn RuleSource>,
    control: Arc<dyn ProxyControl>,
    renderer: Renderer,
    config_path: PathBuf,
    rollback_path: PathBuf,
    pipeline: Mutex<()>,
    last: RwLock<Option<ReconcileResult>>,
}

impl Reconciler {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        control: Arc<dyn ProxyControl>,
        paths: ReconcilerPaths,
    ) -> Self {
        let rollback_path = paths
            .rollback_path
            .unwrap_or_else(|| default_rollback_path(&paths.config_path));
        Self {
            rules,
            control,
            renderer: Renderer::new(paths.template_path),
            config_path: paths.config_path,
            rollback_path,
            pipeline: Mutex::new(()),
            last: RwLock::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn mode(&self) -> DeploymentMode {
        self.control.mode()
    }

    /// Run the pipeline once. Concurrent calls are serialized.
    pub async fn reconcile(&self) -> ReconcileResult {
        let _guard = self.pipeline.lock().await;
        let result = self.run_pipeline().await;

        if result.success {
            info!(
                duration_ms = result.duration_ms,
                config_path = %result.config_path,
                "{}", result.message
            );
        } else {
            warn!(
                state = %result.state,
                kind = ?result.error.as_ref().map(|e| e.kind),
                detail = result.error.as_ref().map(|e| e.detail.as_str()).unwrap_or(""),
                "{}", result.message
            );
        }

        *self.last.write().await = Some(result.clone());
        result
    }

    /// Outcome of the most recent reconcile, if any.
    pub async fn last_result(&self) -> Option<ReconcileResult> {
        self.last.read().await.clone()
    }

    pub async fn status(&self) -> ProxyStatus {
        let version = match self.control.version().await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "Proxy version unavailable");
                None
            }
        };
        ProxyStatus {
            mode: self.control.mode(),
            config_path: self.config_path.display().to_string(),
            config_exists: self.config_path.exists(),
            template_path: self.renderer.template_path().display().to_string(),
            template_exists: self.renderer.template_path().exists(),
            version,
            last_reconcile: self.last_result().await,
        }
    }

    async fn run_pipeline(&self) -> ReconcileResult {
        let mut run = Run::new();

        run.enter(ReconcileState::Rendering);
        let rendered = match self
            .rules
            .enabled_rules()
            .and_then(|rules| self.renderer.render(&rules))
        {
            Ok(rendered) => rendered,
            Err(e) => {
                return run.finish(
                    ReconcileState::Aborted,
                    "render failed".to_string(),
                    &self.config_path,
                    Some(&e),
                    false,
                );
            }
        };

        run.enter(ReconcileState::Writing);
        let had_previous = match self.write_candidate(&rendered.text).await {
            Ok(had_previous) => had_previous,
            Err(e) => {
                return run.finish(
                    ReconcileState::Aborted,
                    "write failed".to_string(),
                    &self.config_path,
                    Some(&e),
                    false,
                );
            }
        };

        run.enter(ReconcileState::Testing);
        let failure = match self.control.test_config(&self.config_path).await {
            Ok(SyntaxCheck::Passed(_)) => None,
            Ok(SyntaxCheck::Unavailable(reason)) => {
                warn!(%reason, "Syntax check unavailable, proceeding");
                None
            }
            Ok(SyntaxCheck::Rejected(output)) => {
                Some(("configuration test failed", Error::syntax(output)))
            }
            Err(e) => Some(("configuration test failed", e)),
        };

        let failure = match failure {
            Some(failure) => Some(failure),
            None => {
                run.enter(ReconcileState::Activating);
                match self.control.reload().await {
                    Ok(_) => None,
                    Err(e) => Some(("reload failed", e)),
                }
            }
        };

        match failure {
            None => run.finish(
                ReconcileState::Committed,
                format!("configuration applied ({} rules)", rendered.rule_count),
                &self.config_path,
                None,
                false,
            ),
            Some((what, e)) => match self.rollback(had_previous).await {
                Ok(()) => run.finish(
                    ReconcileState::RolledBack,
                    format!("{what} (rolled back)"),
                    &self.config_path,
                    Some(&e),
                    true,
                ),
                Err(rollback_err) => {
                    error!(error = %rollback_err, "Rollback failed");
                    run.finish(
                        ReconcileState::Aborted,
                        format!("{what}; rollback failed: {}", rollback_err.detail()),
                        &self.config_path,
                        Some(&e),
                        false,
                    )
                }
            },
        }
    }

    /// Save the live config into the rollback slot, then write `text`.
    /// Returns whether a previous config existed.
    async fn write_candidate(&self, text: &str) -> common::Result<bool> {
        let had_previous = tokio::fs::try_exists(&self.config_path)
            .await
            .unwrap_or(false);

        if had_previous {
            tokio::fs::copy(&self.config_path, &self.rollback_path)
                .await
                .map_err(|e| {
                    Error::write(format!(
                        "cannot save rollback copy {}: {}",
                        self.rollback_path.display(),
                        e
                    ))
                })?;
        }

        if let Some(dir) = self.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::write(format!("cannot create {}: {}", dir.display(), e)))?;
        }

        if let Err(e) = self.replace_live(text).await {
            // A single-file bind mount can be rewritten but not replaced.
            debug!(error = %e, "Cannot replace live config, writing in place");
            if let Err(e) = tokio::fs::write(&self.config_path, text).await {
                // The live file may be truncated now
                if let Err(restore) = self.rollback(had_previous).await {
                    error!(error = %restore, "Cannot restore live config after failed write");
                }
                return Err(Error::write(format!(
                    "cannot write {}: {}",
                    self.config_path.display(),
                    e
                )));
            }
        }

        Ok(had_previous)
    }

    /// Write `text` next to the live config and rename it into place.
    async fn replace_live(&self, text: &str) -> std::io::Result<()> {
        let staged = staging_path(&self.config_path);
        let outcome = async {
            tokio::fs::write(&staged, text).await?;
            tokio::fs::rename(&staged, &self.config_path).await
        }
        .await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        outcome
    }

    async fn rollback(&self, had_previous: bool) -> common::Result<()> {
        if had_previous {
            tokio::fs::copy(&self.rollback_path, &self.config_path)
                .await
                .map_err(|e| {
                    Error::write(format!(
                        "cannot restore {} from {}: {}",
                        self.config_path.display(),
                        self.rollback_path.display(),
                        e
                    ))
                })?;
        } else {
            match tokio::fs::remove_file(&self.config_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::write(format!(
                        "cannot remove {}: {}",
                        self.config_path.display(),
                        e
                    )));
                }
            }
        }
        info!(config_path = %self.config_path.display(), "Previous configuration restored");
        Ok(())
    }
}

// Hidden and without the config suffix so include globs never pick it up.
fn staging_path(config_path: &Path) -> PathBuf {
    let name = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    config_path.with_file_name(format!(".{name}.staged"))
}

fn default_rollback_path(config_path: &Path) -> PathBuf {
    let mut name = config_path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MockProxyControl;
    use rulestore::Rule;
    use std::fs;
    use tempfile::TempDir;

    const TEMPLATE: &str = "# {{generated_at}}\n{{#rules}}\nlocation {{path}} { proxy_pass http://{{target_host}}:{{target_port}}; }\n{{/rules}}\n";

    fn rules() -> Vec<Rule> {
        vec![Rule {
            id: "1".to_string(),
            path: "/api".to_string(),
            target_host: "localhost".to_string(),
            target_port: 8080,
            enabled: true,
            health_check_path: None,
            description: None,
            created_at: None,
            updated_at: None,
        }]
    }

    fn setup(dir: &TempDir, previous: Option<&str>, control: MockProxyControl) -> Reconciler {
        let template_path = dir.path().join("proxy.conf.template");
        fs::write(&template_path, TEMPLATE).unwrap();
        let config_path = dir.path().join("conf.d").join("proxy_rules.conf");
        if let Some(previous) = previous {
            fs::create_dir_all(config_path.parent().unwrap()).unwrap();
            fs::write(&config_path, previous).unwrap();
        }
        Reconciler::new(
            Arc::new(rules()),
            Arc::new(control),
            ReconcilerPaths {
                template_path,
                config_path,
                rollback_path: None,
            },
        )
    }

    #[tokio::test]
    async fn test_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .times(1)
            .returning(|_| Ok(SyntaxCheck::Passed("ok".into())));
        control.expect_reload().times(1).returning(|| Ok(String::new()));

        let reconciler = setup(&dir, Some("old"), control);
        let result = reconciler.reconcile().await;

        assert!(result.success);
        assert_eq!(result.state, ReconcileState::Committed);
        assert!(result.error.is_none());
        let live = fs::read_to_string(reconciler.config_path()).unwrap();
        assert!(live.contains("location /api { proxy_pass http://localhost:8080; }"));

        // Rollback slot holds the previous text
        let slot = fs::read_to_string(default_rollback_path(reconciler.config_path())).unwrap();
        assert_eq!(slot, "old");
        assert_eq!(reconciler.last_result().await, Some(result));
    }

    #[tokio::test]
    async fn test_syntax_rejection_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Rejected("unexpected end of file".into())));
        control.expect_reload().times(0);

        let reconciler = setup(&dir, Some("previous config"), control);
        let result = reconciler.reconcile().await;

        assert!(!result.success);
        assert_eq!(result.state, ReconcileState::RolledBack);
        assert!(result.rolled_back);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::SyntaxError);
        assert_eq!(error.detail, "unexpected end of file");
        assert_eq!(
            fs::read_to_string(reconciler.config_path()).unwrap(),
            "previous config"
        );
    }

    #[tokio::test]
    async fn test_reload_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Passed(String::new())));
        control
            .expect_reload()
            .returning(|| Err(Error::command("nginx exited with status 1")));

        let reconciler = setup(&dir, Some("previous config"), control);
        let result = reconciler.reconcile().await;

        assert!(!result.success);
        assert!(result.message.contains("(rolled back)"));
        assert_eq!(result.error.unwrap().kind, ErrorKind::CommandFailure);
        assert_eq!(
            fs::read_to_string(reconciler.config_path()).unwrap(),
            "previous config"
        );
    }

    #[tokio::test]
    async fn test_timeout_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Err(Error::timeout("syntax check did not finish within 10s")));
        control.expect_reload().times(0);

        let reconciler = setup(&dir, Some("previous config"), control);
        let result = reconciler.reconcile().await;

        assert_eq!(result.state, ReconcileState::RolledBack);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_rollback_without_previous_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Rejected("bad".into())));

        let reconciler = setup(&dir, None, control);
        let result = reconciler.reconcile().await;

        assert!(result.rolled_back);
        assert!(!reconciler.config_path().exists());
    }

    #[tokio::test]
    async fn test_unavailable_check_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Unavailable("nginx not found".into())));
        control.expect_reload().times(1).returning(|| Ok(String::new()));

        let reconciler = setup(&dir, None, control);
        let result = reconciler.reconcile().await;

        assert!(result.success);
        assert!(reconciler.config_path().exists());
    }

    #[tokio::test]
    async fn test_missing_template_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control.expect_test_config().times(0);
        control.expect_reload().times(0);

        let reconciler = setup(&dir, Some("previous config"), control);
        fs::remove_file(dir.path().join("proxy.conf.template")).unwrap();

        let result = reconciler.reconcile().await;
        assert_eq!(result.state, ReconcileState::Aborted);
        assert_eq!(result.error.unwrap().kind, ErrorKind::TemplateError);
        assert!(!result.rolled_back);
        assert_eq!(
            fs::read_to_string(reconciler.config_path()).unwrap(),
            "previous config"
        );
        assert!(!default_rollback_path(reconciler.config_path()).exists());
    }

    #[tokio::test]
    async fn test_write_error_aborts_before_testing() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control.expect_test_config().times(0);
        control.expect_reload().times(0);

        let reconciler = setup(&dir, None, control);
        // The config directory cannot be created over a regular file
        fs::write(dir.path().join("conf.d"), "not a directory").unwrap();

        let result = reconciler.reconcile().await;
        assert!(!result.success);
        assert_eq!(result.state, ReconcileState::Aborted);
        assert_eq!(result.message, "write failed");
        assert_eq!(result.error.unwrap().kind, ErrorKind::WriteError);
        assert!(!result.rolled_back);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_config_is_replaced_not_truncated() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Passed(String::new())));
        control.expect_reload().returning(|| Ok(String::new()));

        let reconciler = setup(&dir, Some("old"), control);
        let before = fs::metadata(reconciler.config_path()).unwrap().ino();

        assert!(reconciler.reconcile().await.success);
        let after = fs::metadata(reconciler.config_path()).unwrap().ino();
        assert_ne!(before, after);
        assert!(!staging_path(reconciler.config_path()).exists());
    }

    #[tokio::test]
    async fn test_unreplaceable_config_is_written_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_test_config()
            .returning(|_| Ok(SyntaxCheck::Passed(String::new())));
        control.expect_reload().returning(|| Ok(String::new()));

        let reconciler = setup(&dir, Some("old"), control);
        // Occupy the staging name so the rename path cannot be used
        fs::create_dir(staging_path(reconciler.config_path())).unwrap();

        let result = reconciler.reconcile().await;
        assert!(result.success);
        let live = fs::read_to_string(reconciler.config_path()).unwrap();
        assert!(live.contains("location /api"));
    }

    #[tokio::test]
    async fn test_status_reports_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = MockProxyControl::new();
        control
            .expect_version()
            .returning(|| Ok("nginx version: nginx/1.25.3".into()));
        control.expect_mode().return_const(DeploymentMode::Container);

        let reconciler = setup(&dir, None, control);
        let status = reconciler.status().await;

        assert_eq!(status.mode, DeploymentMode::Container);
        assert!(status.template_exists);
        assert!(!status.config_exists);
        assert_eq!(status.version.as_deref(), Some("nginx version: nginx/1.25.3"));
        assert!(status.last_reconcile.is_none());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ReconcileState::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        assert_eq!(ReconcileState::RolledBack.to_string(), "rolled_back");
    }
}
