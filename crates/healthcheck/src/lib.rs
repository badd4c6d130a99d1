//! Backend health polling for proxy rules.
//!
//! This crate keeps a best-effort view of backend reachability:
//! - TCP connect probes with a per-probe timeout
//! - A background poller probing every enabled rule concurrently
//! - Aggregate statistics and a monitor report derived from the latest results
//!
//! Results may be up to one polling interval stale. A probe task that
//! panics is dropped and its rule keeps the previous result.
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{HealthPoller, PollerConfig, TcpProber};
//! use rulestore::RuleStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let store = Arc::new(RuleStore::open("config/proxy_config.yaml", "config/backups", 10)?);
//! let poller = HealthPoller::new(store, Arc::new(TcpProber::new()), PollerConfig::default());
//! poller.start();
//!
//! let stats = poller.statistics()?;
//! println!("{}/{} healthy", stats.healthy, stats.total);
//! poller.stop();
//! # Ok(())
//! # }
//! ```

pub mod poller;
pub mod prober;
pub mod stats;
pub mod types;

pub use poller::{HealthPoller, ResultObserver};
pub use prober::{Prober, TcpProber};
pub use stats::{HealthStatistics, MonitorReport, OverallStatus, ServiceReport};
pub use types::{HealthCheckResult, HealthStatus, PollerConfig, ProbeOutcome};
