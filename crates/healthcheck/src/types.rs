//! Health check types and structures.

use chrono::{DateTime, Utc};
use rulestore::Rule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Health of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last probe connected
    Healthy,
    /// Last probe failed
    Unhealthy,
    /// Never probed
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Connection established after the given time
    Reachable(Duration),
    /// Connection failed, with a human-readable cause
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn timeout() -> Self {
        ProbeOutcome::Unreachable("timeout".to_string())
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }
}

/// Latest health of one rule's backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub rule_id: String,

    /// Copied from the rule at probe time
    pub path: String,

    /// Informational
    pub target_url: String,

    pub status: HealthStatus,

    /// Present only when healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,

    /// Present only when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub last_check_time: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Build a result for `rule` from a probe outcome
    pub fn from_probe(rule: &Rule, outcome: ProbeOutcome, at: DateTime<Utc>) -> Self {
        let (status, response_time_ms, error_message) = match outcome {
            ProbeOutcome::Reachable(elapsed) => (
                HealthStatus::Healthy,
                Some(round2(elapsed.as_secs_f64() * 1000.0)),
                None,
            ),
            ProbeOutcome::Unreachable(cause) => (HealthStatus::Unhealthy, None, Some(cause)),
        };

        Self {
            rule_id: rule.id.clone(),
            path: rule.path.clone(),
            target_url: rule.target_url(),
            status,
            response_time_ms,
            error_message,
            last_check_time: at,
        }
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Whether this result was probed for `rule` as it stands now.
    ///
    /// Ids are reused after a delete, and an update can move a rule to a
    /// new backend, so the id alone is not enough.
    pub fn describes(&self, rule: &Rule) -> bool {
        self.rule_id == rule.id && self.path == rule.path && self.target_url == rule.target_url()
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Health poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Pause between the end of one cycle and the start of the next
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Optional cap on probes in flight
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_concurrency: None,
        }
    }
}
