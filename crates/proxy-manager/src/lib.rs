//! Proxy manager daemon.
//!
//! Manages reverse-proxy routing rules and keeps the proxy's live
//! configuration in sync with them.
//!
//! # Components
//!
//! - **Config**: YAML settings with validation and environment overrides
//! - **HTTP API**: rule CRUD, reload, health, snapshot endpoints and `/metrics`
//! - **Notifier**: pushes degradation and recovery alerts to ntfy
//! - **Telemetry**: tracing subscriber with optional OTLP export
//!
//! Rule storage, reconciliation and health polling live in the
//! `rulestore`, `reconciler` and `healthcheck` crates.

pub mod config;
pub mod http_server;
pub mod metrics;
pub mod notifier;
pub mod server;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use http_server::{ApiServer, AppState, router};
pub use metrics::MetricsRegistry;
pub use notifier::{Alert, AlertKind, AlertPolicy, AlertSink, Notifier, NtfySink};
pub use server::{ProxyManager, shutdown_signal};
pub use telemetry::{TelemetryGuard, setup_tracing};
