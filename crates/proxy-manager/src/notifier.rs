//! Health alerts pushed to an ntfy topic.
//!
//! [`AlertPolicy`] decides what to send from successive monitor reports;
//! it holds no clock of its own so it can be driven deterministically.
//! [`Notifier`] runs the policy on an interval against the in-process
//! poller and hands alerts to an [`AlertSink`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healthcheck::{HealthPoller, MonitorReport, OverallStatus, ServiceReport};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// ntfy message priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Default,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Default => "default",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

/// Why an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Previously failing services are healthy again
    Recovered,
    /// At least one service started failing
    Degraded,
    /// Failures continue past the alert interval
    StillDegraded,
    /// Periodic all-clear digest
    Healthy,
    /// The monitor report could not be produced
    Unreachable,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::Recovered => "recovered",
            AlertKind::Degraded => "degraded",
            AlertKind::StillDegraded => "still_degraded",
            AlertKind::Healthy => "healthy",
            AlertKind::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// A rendered notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub title: String,
    /// Markdown
    pub body: String,
    pub priority: Priority,
    pub tags: &'static str,
}

/// Alert decision state
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    alert_interval: Duration,
    healthy_interval: Duration,
    last_alert_at: Option<DateTime<Utc>>,
    last_healthy_at: Option<DateTime<Utc>>,
    last_unhealthy: BTreeSet<String>,
}

impl AlertPolicy {
    pub fn new(alert_interval: Duration, healthy_interval: Duration) -> Self {
        Self {
            alert_interval,
            healthy_interval,
            last_alert_at: None,
            last_healthy_at: None,
            last_unhealthy: BTreeSet::new(),
        }
    }

    /// Paths that were unhealthy at the last evaluation
    pub fn last_unhealthy(&self) -> &BTreeSet<String> {
        &self.last_unhealthy
    }

    /// Evaluate a fresh report observed at `now`.
    pub fn evaluate(&mut self, report: &MonitorReport, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let current: BTreeSet<String> = report
            .unhealthy_services
            .iter()
            .map(|s| s.path.clone())
            .collect();

        let recovered: Vec<&String> = self.last_unhealthy.difference(&current).collect();
        if !recovered.is_empty() {
            alerts.push(Alert {
                kind: AlertKind::Recovered,
                title: "Services recovered".to_string(),
                body: recovered_body(&recovered),
                priority: Priority::Default,
                tags: "white_check_mark,server",
            });
            self.last_alert_at = Some(now);
        }

        if report.overall_status != OverallStatus::Healthy && !report.unhealthy_services.is_empty() {
            let has_new = current.difference(&self.last_unhealthy).next().is_some();
            if has_new || due(self.last_alert_at, self.alert_interval, now) {
                let (kind, title, tags) = if has_new {
                    (AlertKind::Degraded, "Service alert", "rotating_light,server")
                } else {
                    (AlertKind::StillDegraded, "Services still degraded", "warning,server")
                };
                alerts.push(Alert {
                    kind,
                    title: title.to_string(),
                    body: degraded_body(report),
                    priority: Priority::High,
                    tags,
                });
                self.last_alert_at = Some(now);
            } else {
                debug!(unhealthy = report.unhealthy, "Degraded, alert suppressed until interval");
            }
        } else if report.overall_status == OverallStatus::Healthy {
            if due(self.last_healthy_at, self.healthy_interval, now) {
                alerts.push(Alert {
                    kind: AlertKind::Healthy,
                    title: "All services healthy".to_string(),
                    body: healthy_body(report),
                    priority: Priority::Low,
                    tags: "white_check_mark,server",
                });
                self.last_healthy_at = Some(now);
            } else {
                debug!(total = report.total, "All services healthy");
            }
        }

        self.last_unhealthy = current;
        alerts
    }

    /// Evaluate a failure to produce the report at `now`.
    pub fn evaluate_unavailable(&mut self, detail: &str, now: DateTime<Utc>) -> Option<Alert> {
        if !due(self.last_alert_at, self.alert_interval, now) {
            debug!("Monitor report unavailable, alert suppressed until interval");
            return None;
        }
        self.last_alert_at = Some(now);
        Some(Alert {
            kind: AlertKind::Unreachable,
            title: "Monitor unreachable".to_string(),
            body: format!(
                "Cannot build the monitor report: `{}`\n\nCheck that the proxy manager is healthy.",
                detail
            ),
            priority: Priority::Urgent,
            tags: "rotating_light,server",
        })
    }
}

fn due(last: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(at) => (now - at).to_std().is_ok_and(|elapsed| elapsed >= interval),
    }
}

fn label(service: &ServiceReport) -> String {
    match service.description.as_deref().filter(|d| !d.is_empty()) {
        Some(description) => format!("{} ({})", description, service.path),
        None => service.path.clone(),
    }
}

fn recovered_body(paths: &[&String]) -> String {
    let mut lines = vec!["The following services are healthy again:".to_string(), String::new()];
    lines.extend(paths.iter().map(|p| format!("- **{}**", p)));
    lines.join("\n")
}

fn degraded_body(report: &MonitorReport) -> String {
    let mut lines = vec![
        format!(
            "**Total**: {} | healthy: {} | unhealthy: {}",
            report.total, report.healthy, report.unhealthy
        ),
        String::new(),
    ];
    for service in &report.unhealthy_services {
        lines.push(format!("- **{}** -> `{}`", label(service), service.target));
        lines.push(format!(
            "  error: {}",
            service.error.as_deref().unwrap_or("unknown error")
        ));
    }
    lines.join("\n")
}

fn healthy_body(report: &MonitorReport) -> String {
    let mut lines = vec![
        format!("**Total**: {} | all healthy: {}", report.total, report.healthy),
        String::new(),
    ];
    for service in &report.services {
        let time = service
            .response_time_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        lines.push(format!("- **{}**{}", label(service), time));
    }
    if let Some(avg) = report.avg_response_time_ms {
        lines.push(format!("\n**Average response time**: {}ms", avg));
    }
    lines.join("\n")
}

/// Alert delivery error
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification rejected with status {0}")]
    Rejected(u16),
}

/// Delivers alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Posts alerts to `<ntfy_url>/<topic>`
pub struct NtfySink {
    client: reqwest::Client,
    url: String,
}

impl NtfySink {
    pub fn new(ntfy_url: &str, topic: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/{}", ntfy_url.trim_end_matches('/'), topic),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSink for NtfySink {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        // Header values must be visible ASCII
        let title: String = alert
            .title
            .chars()
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        let response = self
            .client
            .post(&self.url)
            .header("Title", title.trim())
            .header("Priority", alert.priority.as_str())
            .header("Tags", alert.tags)
            .header("Markdown", "yes")
            .body(alert.body.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Where the notifier reads monitor reports from
pub trait ReportSource: Send + Sync {
    fn monitor_report(&self) -> common::Result<MonitorReport>;
}

impl ReportSource for HealthPoller {
    fn monitor_report(&self) -> common::Result<MonitorReport> {
        HealthPoller::monitor_report(self)
    }
}

/// Periodic alert task
pub struct Notifier {
    source: Arc<dyn ReportSource>,
    sink: Arc<dyn AlertSink>,
    policy: AlertPolicy,
    check_interval: Duration,
}

impl Notifier {
    pub fn new(
        source: Arc<dyn ReportSource>,
        sink: Arc<dyn AlertSink>,
        policy: AlertPolicy,
        check_interval: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            policy,
            check_interval,
        }
    }

    /// Evaluate once and deliver. Returns the number of alerts delivered.
    pub async fn tick(&mut self) -> usize {
        let now = Utc::now();
        let alerts = match self.source.monitor_report() {
            Ok(report) => self.policy.evaluate(&report, now),
            Err(e) => {
                warn!(error = %e, "Monitor report unavailable");
                self.policy
                    .evaluate_unavailable(&e.to_string(), now)
                    .into_iter()
                    .collect()
            }
        };

        let mut delivered = 0;
        for alert in &alerts {
            match self.sink.send(alert).await {
                Ok(()) => {
                    info!(kind = %alert.kind, title = %alert.title, "Alert sent");
                    delivered += 1;
                }
                Err(e) => warn!(kind = %alert.kind, error = %e, "Failed to send alert"),
            }
        }
        delivered
    }

    /// Run until `token` is cancelled. The first evaluation is immediate.
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Notifier task started"
        );
        loop {
            self.tick().await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        info!("Notifier task stopped");
    }
}
