//! Configuration loading and validation for proxy-manager

use healthcheck::PollerConfig;
use reconciler::{ContainerTarget, DeploymentMode, ProxyCommands, ReconcilerPaths};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PROXY_MANAGER_CONFIG";

/// Environment variable overriding `proxy.container.name`.
pub const CONTAINER_NAME_ENV: &str = "NGINX_CONTAINER_NAME";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub notifier: NotifierSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.store.validate()?;
        self.proxy.validate()?;
        self.health.validate()?;
        self.notifier.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Rule document and snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreSettings {
    #[validate(length(min = 1))]
    pub rules_path: String,

    /// Defaults to `<rules dir>/backups`.
    pub snapshot_dir: Option<String>,

    #[validate(range(min = 1, max = 1000))]
    pub snapshot_retention: usize,
}

/// How the proxy is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSetting {
    Auto,
    Local,
    Container,
}

/// Container exec target
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ContainerSettings {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    pub runtime: String,
}

/// Proxy rendering and control settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxySettings {
    #[validate(length(min = 1))]
    pub template_path: String,

    #[validate(length(min = 1))]
    pub config_path: String,

    pub rollback_path: Option<String>,

    #[validate(length(min = 1))]
    pub binary: String,

    pub test_args: Vec<String>,
    pub reload_args: Vec<String>,
    pub version_args: Vec<String>,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_command_timeout")]
    pub command_timeout: Duration,

    pub mode: ModeSetting,

    #[validate]
    pub container: ContainerSettings,

    /// Reconcile after every successful rule mutation.
    pub reconcile_on_change: bool,
}

/// Health poller settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_health_interval")]
    pub interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub timeout: Duration,

    #[validate(range(min = 1, max = 10000))]
    pub max_concurrency: Option<usize>,
}

/// ntfy alert settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_notifier"))]
pub struct NotifierSettings {
    pub enabled: bool,

    #[validate(custom = "validate_http_url")]
    pub ntfy_url: String,

    pub topic: String,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_notifier_interval")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_notifier_interval")]
    pub alert_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_notifier_interval")]
    pub healthy_interval: Duration,
}

/// Prometheus exposition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: LogFormat,
}

impl LoggingSettings {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }
}

/// OpenTelemetry export settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub service_name: String,

    #[validate(custom = "validate_http_url")]
    pub otlp_endpoint: String,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            rules_path: "config/proxy_config.yaml".to_string(),
            snapshot_dir: None,
            snapshot_retention: rulestore::DEFAULT_SNAPSHOT_RETENTION,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let target = ContainerTarget::default();
        Self {
            name: target.name,
            runtime: target.runtime,
        }
    }
}

/// Template shipped with this crate.
pub const DEFAULT_TEMPLATE_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/templates/proxy_rules.conf.template");

impl Default for ProxySettings {
    fn default() -> Self {
        let commands = ProxyCommands::default();
        Self {
            template_path: DEFAULT_TEMPLATE_PATH.to_string(),
            config_path: "/etc/nginx/conf.d/proxy_rules.conf".to_string(),
            rollback_path: None,
            binary: commands.binary,
            test_args: commands.test_args,
            reload_args: commands.reload_args,
            version_args: commands.version_args,
            command_timeout: commands.timeout,
            mode: ModeSetting::Auto,
            container: ContainerSettings::default(),
            reconcile_on_change: true,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        let poller = PollerConfig::default();
        Self {
            interval: poller.interval,
            timeout: poller.timeout,
            max_concurrency: poller.max_concurrency,
        }
    }
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ntfy_url: "https://ntfy.sh".to_string(),
            topic: String::new(),
            check_interval: Duration::from_secs(60),
            alert_interval: Duration::from_secs(600),
            healthy_interval: Duration::from_secs(6 * 3600),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "proxy-manager".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_http_url(url: &str) -> Result<(), ValidationError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| ValidationError::new("url_scheme_invalid"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ValidationError::new("url_host_missing"));
    }
    Ok(())
}

fn validate_command_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    if *timeout < Duration::from_millis(100) || *timeout > Duration::from_secs(300) {
        return Err(ValidationError::new("command_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_health_interval(interval: &Duration) -> Result<(), ValidationError> {
    if *interval < Duration::from_secs(1) || *interval > Duration::from_secs(3600) {
        return Err(ValidationError::new("health_interval_out_of_range"));
    }
    Ok(())
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    if *timeout < Duration::from_millis(10) || *timeout > Duration::from_secs(300) {
        return Err(ValidationError::new("probe_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_notifier_interval(interval: &Duration) -> Result<(), ValidationError> {
    if interval.is_zero() {
        return Err(ValidationError::new("notifier_interval_zero"));
    }
    Ok(())
}

fn validate_notifier(settings: &NotifierSettings) -> Result<(), ValidationError> {
    if settings.enabled && settings.topic.trim().is_empty() {
        return Err(ValidationError::new("notifier_topic_required"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths, then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(explicit) => {
                let path = PathBuf::from(explicit);
                if !path.is_file() {
                    return Err(ConfigError::FileNotFound(path));
                }
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => match Self::find_config_file() {
                Some(path) => {
                    tracing::info!("Loading configuration from: {}", path.display());
                    Self::load_from_file(&path)?
                }
                None => {
                    tracing::info!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup(CONTAINER_NAME_ENV).filter(|n| !n.trim().is_empty()) {
            self.proxy.container.name = name;
        }
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/proxy-manager/proxy-manager.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./proxy-manager.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/proxy-manager/proxy-manager.yaml"))
    }

    pub fn rules_path(&self) -> PathBuf {
        PathBuf::from(&self.store.rules_path)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        match &self.store.snapshot_dir {
            Some(dir) => PathBuf::from(dir),
            None => self
                .rules_path()
                .parent()
                .map(|parent| parent.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.health.interval,
            timeout: self.health.timeout,
            max_concurrency: self.health.max_concurrency,
        }
    }

    pub fn proxy_commands(&self) -> ProxyCommands {
        ProxyCommands {
            binary: self.proxy.binary.clone(),
            test_args: self.proxy.test_args.clone(),
            reload_args: self.proxy.reload_args.clone(),
            version_args: self.proxy.version_args.clone(),
            timeout: self.proxy.command_timeout,
        }
    }

    pub fn container_target(&self) -> ContainerTarget {
        ContainerTarget {
            runtime: self.proxy.container.runtime.clone(),
            name: self.proxy.container.name.clone(),
        }
    }

    /// Resolve the deployment mode. `auto` probes the environment.
    pub fn deployment_mode(&self) -> DeploymentMode {
        match self.proxy.mode {
            ModeSetting::Auto => DeploymentMode::detect(),
            ModeSetting::Local => DeploymentMode::Local,
            ModeSetting::Container => DeploymentMode::Container,
        }
    }

    pub fn reconciler_paths(&self) -> ReconcilerPaths {
        ReconcilerPaths {
            template_path: PathBuf::from(&self.proxy.template_path),
            config_path: PathBuf::from(&self.proxy.config_path),
            rollback_path: self.proxy.rollback_path.as_ref().map(PathBuf::from),
        }
    }
}
