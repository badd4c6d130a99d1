//! Turns the enabled rule set into a live proxy configuration.
//!
//! One invocation runs `Rendering -> Writing -> Testing -> Activating` and
//! ends `Committed`, `RolledBack` or `Aborted`. A failure after the write
//! restores the previous configuration from a single rollback slot.
//!
//! # Example
//!
//! ```no_run
//! use reconciler::{DeploymentMode, ProxyCommands, ContainerTarget, Reconciler, ReconcilerPaths, build_control};
//! use rulestore::RuleStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let store = Arc::new(RuleStore::open("config/proxy_config.yaml", "config/backups", 10)?);
//! let control = build_control(DeploymentMode::detect(), ProxyCommands::default(), ContainerTarget::default());
//!
//! let reconciler = Reconciler::new(store, control, ReconcilerPaths {
//!     template_path: "templates/proxy_rules.conf.template".into(),
//!     config_path: "/etc/nginx/conf.d/proxy_rules.conf".into(),
//!     rollback_path: None,
//! });
//!
//! let result = reconciler.reconcile().await;
//! println!("{}: {}", result.state, result.message);
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod reconcile;
pub mod render;

pub use control::{
    ContainerControl, ContainerTarget, DeploymentMode, LocalControl, ProxyCommands, ProxyControl,
    SyntaxCheck, build_control,
};
pub use reconcile::{
    FailureInfo, ProxyStatus, ReconcileResult, ReconcileState, Reconciler, ReconcilerPaths,
};
pub use render::{RenderedConfig, Renderer, Template};
