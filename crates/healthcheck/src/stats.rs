//! Aggregate views over the latest health results.

use crate::types::{HealthCheckResult, HealthStatus, round2};
use chrono::{DateTime, Utc};
use rulestore::Rule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Counts and latency over the enabled rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatistics {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Rules without a conclusive result
    pub unknown: usize,
    /// Percentage, two decimals. 0 when there are no rules.
    pub health_rate: f64,
    /// Mean over results with a recorded latency, two decimals.
    pub avg_response_time_ms: Option<f64>,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// The result probed for `rule` in its current shape, if any.
pub fn current_result<'a>(
    rule: &Rule,
    results: &'a HashMap<String, HealthCheckResult>,
) -> Option<&'a HealthCheckResult> {
    results.get(&rule.id).filter(|result| result.describes(rule))
}

/// Summarize `results` against the enabled `rules`.
///
/// Results for rules not in `rules`, or probed before the rule's path or
/// target changed, are ignored.
pub fn summarize(rules: &[Rule], results: &HashMap<String, HealthCheckResult>) -> HealthStatistics {
    let mut healthy = 0;
    let mut unhealthy = 0;
    let mut latencies = Vec::new();
    let mut last_check_time: Option<DateTime<Utc>> = None;

    for result in rules.iter().filter_map(|r| current_result(r, results)) {
        match result.status {
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Unhealthy => unhealthy += 1,
            HealthStatus::Unknown => {}
        }
        if let Some(ms) = result.response_time_ms {
            latencies.push(ms);
        }
        last_check_time = last_check_time.max(Some(result.last_check_time));
    }

    let total = rules.len();
    let health_rate = if total == 0 {
        0.0
    } else {
        round2(healthy as f64 / total as f64 * 100.0)
    };
    let avg_response_time_ms = if latencies.is_empty() {
        None
    } else {
        Some(round2(latencies.iter().sum::<f64>() / latencies.len() as f64))
    };

    HealthStatistics {
        total,
        healthy,
        unhealthy,
        unknown: total - healthy - unhealthy,
        health_rate,
        avg_response_time_ms,
        last_check_time,
    }
}

/// Overall verdict for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unknown,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Healthy => write!(f, "healthy"),
            OverallStatus::Degraded => write!(f, "degraded"),
            OverallStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One service line in a [`MonitorReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub rule_id: String,
    pub path: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload consumed by the alert notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub overall_status: OverallStatus,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub avg_response_time_ms: Option<f64>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub services: Vec<ServiceReport>,
    pub unhealthy_services: Vec<ServiceReport>,
}

pub fn monitor_report(rules: &[Rule], results: &HashMap<String, HealthCheckResult>) -> MonitorReport {
    let stats = summarize(rules, results);

    let services: Vec<ServiceReport> = rules
        .iter()
        .map(|rule| {
            let result = current_result(rule, results);
            ServiceReport {
                rule_id: rule.id.clone(),
                path: rule.path.clone(),
                target: rule.target(),
                description: rule.description.clone(),
                status: result.map(|r| r.status).unwrap_or(HealthStatus::Unknown),
                response_time_ms: result.and_then(|r| r.response_time_ms),
                error: result.and_then(|r| r.error_message.clone()),
            }
        })
        .collect();

    let unhealthy_services = services
        .iter()
        .filter(|s| s.status == HealthStatus::Unhealthy)
        .cloned()
        .collect();

    let overall_status = if stats.unhealthy > 0 {
        OverallStatus::Degraded
    } else if stats.total > 0 && stats.healthy == stats.total {
        OverallStatus::Healthy
    } else {
        OverallStatus::Unknown
    };

    MonitorReport {
        overall_status,
        total: stats.total,
        healthy: stats.healthy,
        unhealthy: stats.unhealthy,
        unknown: stats.unknown,
        avg_response_time_ms: stats.avg_response_time_ms,
        last_check_time: stats.last_check_time,
        services,
        unhealthy_services,
    }
}
