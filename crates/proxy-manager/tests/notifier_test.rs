//! Integration tests for the alert notifier

use async_trait::async_trait;
use axum::Router;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use common::Error;
use healthcheck::{HealthPoller, HealthStatus, MonitorReport, OverallStatus, PollerConfig, ServiceReport, TcpProber};
use proxy_manager::notifier::{
    Alert, AlertKind, AlertPolicy, AlertSink, Notifier, NotifyError, NtfySink, Priority, ReportSource,
};
use rulestore::Rule;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Captured = (String, HeaderMap, String);

/// Helper to start a server that records posted notifications
async fn capture_server(reply: StatusCode) -> (String, mpsc::UnboundedReceiver<Captured>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/:topic",
        post(move |Path(topic): Path<String>, headers: HeaderMap, body: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((topic, headers, body));
                reply
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

fn alert() -> Alert {
    Alert {
        kind: AlertKind::Degraded,
        title: "Service alert".to_string(),
        body: "- **/api** -> `localhost:8080`".to_string(),
        priority: Priority::High,
        tags: "rotating_light,server",
    }
}

fn service(path: &str, status: HealthStatus) -> ServiceReport {
    ServiceReport {
        rule_id: path.trim_start_matches('/').to_string(),
        path: path.to_string(),
        target: "localhost:8080".to_string(),
        description: None,
        status,
        response_time_ms: None,
        error: (status == HealthStatus::Unhealthy).then(|| "connection refused".to_string()),
    }
}

fn report(overall_status: OverallStatus, services: Vec<ServiceReport>) -> MonitorReport {
    let unhealthy_services: Vec<ServiceReport> = services
        .iter()
        .filter(|s| s.status == HealthStatus::Unhealthy)
        .cloned()
        .collect();
    let healthy = services.iter().filter(|s| s.status == HealthStatus::Healthy).count();
    MonitorReport {
        overall_status,
        total: services.len(),
        healthy,
        unhealthy: unhealthy_services.len(),
        unknown: services.len() - healthy - unhealthy_services.len(),
        avg_response_time_ms: None,
        last_check_time: None,
        services,
        unhealthy_services,
    }
}

/// Returns queued reports in order; `None` simulates a failure
struct Scripted(Mutex<VecDeque<Option<MonitorReport>>>);

impl Scripted {
    fn new(reports: Vec<Option<MonitorReport>>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(reports.into())))
    }
}

impl ReportSource for Scripted {
    fn monitor_report(&self) -> common::Result<MonitorReport> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .flatten()
            .ok_or_else(|| Error::invalid_state("rule document unreadable"))
    }
}

#[derive(Default)]
struct Recording(Mutex<Vec<Alert>>);

#[async_trait]
impl AlertSink for Recording {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

impl Recording {
    fn kinds(&self) -> Vec<AlertKind> {
        self.0.lock().unwrap().iter().map(|a| a.kind).collect()
    }
}

#[tokio::test]
async fn test_ntfy_sink_posts_markdown() {
    let (base, mut rx) = capture_server(StatusCode::OK).await;
    let sink = NtfySink::new(&base, "ops-alerts").unwrap();

    sink.send(&alert()).await.unwrap();

    let (topic, headers, body) = rx.recv().await.unwrap();
    assert_eq!(topic, "ops-alerts");
    assert_eq!(headers["title"], "Service alert");
    assert_eq!(headers["priority"], "high");
    assert_eq!(headers["tags"], "rotating_light,server");
    assert_eq!(headers["markdown"], "yes");
    assert_eq!(body, "- **/api** -> `localhost:8080`");
}

#[tokio::test]
async fn test_ntfy_sink_strips_non_ascii_title() {
    let (base, mut rx) = capture_server(StatusCode::OK).await;
    let sink = NtfySink::new(&base, "ops").unwrap();

    let mut titled = alert();
    titled.title = "Service alert \u{1F6A8}".to_string();
    sink.send(&titled).await.unwrap();

    let (_, headers, _) = rx.recv().await.unwrap();
    assert_eq!(headers["title"], "Service alert");
}

#[tokio::test]
async fn test_ntfy_sink_reports_rejection() {
    let (base, _rx) = capture_server(StatusCode::SERVICE_UNAVAILABLE).await;
    let sink = NtfySink::new(&base, "ops").unwrap();

    let err = sink.send(&alert()).await.unwrap_err();
    assert!(matches!(err, NotifyError::Rejected(503)));
}

#[tokio::test]
async fn test_notifier_follows_policy() {
    let degraded = report(OverallStatus::Degraded, vec![service("/api", HealthStatus::Unhealthy)]);
    let healthy = report(OverallStatus::Healthy, vec![service("/api", HealthStatus::Healthy)]);
    let source = Scripted::new(vec![Some(degraded.clone()), Some(degraded), Some(healthy), None]);
    let sink = Arc::new(Recording::default());

    let mut notifier = Notifier::new(
        source,
        sink.clone(),
        AlertPolicy::new(Duration::from_millis(50), Duration::from_secs(3600)),
        Duration::from_secs(60),
    );

    assert_eq!(notifier.tick().await, 1);
    // Same failure within the alert interval
    assert_eq!(notifier.tick().await, 0);
    // Recovery plus the first healthy digest
    assert_eq!(notifier.tick().await, 2);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(notifier.tick().await, 1);

    assert_eq!(
        sink.kinds(),
        vec![
            AlertKind::Degraded,
            AlertKind::Recovered,
            AlertKind::Healthy,
            AlertKind::Unreachable,
        ]
    );
}

#[tokio::test]
async fn test_send_failures_are_not_fatal() {
    struct Failing(AtomicUsize);

    #[async_trait]
    impl AlertSink for Failing {
        async fn send(&self, _alert: &Alert) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Rejected(500))
        }
    }

    let degraded = report(OverallStatus::Degraded, vec![service("/api", HealthStatus::Unhealthy)]);
    let sink = Arc::new(Failing(AtomicUsize::new(0)));
    let mut notifier = Notifier::new(
        Scripted::new(vec![Some(degraded.clone()), Some(degraded)]),
        sink.clone(),
        AlertPolicy::new(Duration::from_secs(600), Duration::from_secs(3600)),
        Duration::from_secs(60),
    );

    assert_eq!(notifier.tick().await, 0);
    // The failed attempt still counts toward the alert interval
    assert_eq!(notifier.tick().await, 0);
    assert_eq!(sink.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_notifier_reads_poller_reports() {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let rule = Rule {
        id: "1".to_string(),
        path: "/api".to_string(),
        target_host: "127.0.0.1".to_string(),
        target_port: closed_port,
        enabled: true,
        health_check_path: None,
        description: Some("Public API".to_string()),
        created_at: None,
        updated_at: None,
    };
    let poller = Arc::new(HealthPoller::new(
        Arc::new(vec![rule]),
        Arc::new(TcpProber::new()),
        PollerConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(1),
            max_concurrency: None,
        },
    ));
    poller.check_all().await.unwrap();

    let sink = Arc::new(Recording::default());
    let mut notifier = Notifier::new(
        poller,
        sink.clone(),
        AlertPolicy::new(Duration::from_secs(600), Duration::from_secs(3600)),
        Duration::from_secs(60),
    );
    assert_eq!(notifier.tick().await, 1);

    let alerts = sink.0.lock().unwrap();
    assert_eq!(alerts[0].kind, AlertKind::Degraded);
    assert!(alerts[0].body.contains("- **Public API (/api)** -> `127.0.0.1:"));
    assert!(alerts[0].body.contains("error: connection refused"));
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let healthy = report(OverallStatus::Healthy, vec![service("/api", HealthStatus::Healthy)]);
    let source = Scripted::new(vec![Some(healthy); 100]);
    let sink = Arc::new(Recording::default());
    let notifier = Notifier::new(
        source,
        sink.clone(),
        AlertPolicy::new(Duration::from_secs(600), Duration::from_secs(3600)),
        Duration::from_millis(20),
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(notifier.run(token.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    // Only the first evaluation produced a digest
    assert_eq!(sink.kinds(), vec![AlertKind::Healthy]);
}
