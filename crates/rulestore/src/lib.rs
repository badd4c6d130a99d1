//! Durable store for reverse-proxy routing rules.
//!
//! Rules live in a single YAML document with a `rules` list. Every mutation
//! first copies the current document into a timestamped snapshot; only the
//! most recent snapshots are kept.
//!
//! # Example
//!
//! ```no_run
//! use rulestore::{NewRule, RuleStore};
//!
//! # fn example() -> common::Result<()> {
//! let store = RuleStore::open("config/proxy_config.yaml", "config/backups", 10)?;
//! let rule = store.add(NewRule::new("/api", 8080).with_host("10.0.0.5"))?;
//! assert_eq!(store.get(&rule.id)?.path, "/api");
//! # Ok(())
//! # }
//! ```

pub mod model;
pub mod snapshot;
pub mod store;

pub use model::{NewRule, Rule, RuleUpdate};
pub use snapshot::SnapshotInfo;
pub use store::{DEFAULT_SNAPSHOT_RETENTION, RuleSource, RuleStore, RulesDocument, ValidationReport};
