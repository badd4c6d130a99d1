//! HTTP API and metrics endpoint.

use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use common::{Error, ErrorKind};
use healthcheck::HealthPoller;
use reconciler::{ReconcileResult, Reconciler};
use rulestore::{NewRule, Rule, RuleStore, RuleUpdate, SnapshotInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RuleStore>,
    pub reconciler: Arc<Reconciler>,
    pub poller: Arc<HealthPoller>,
    pub metrics: Option<Arc<MetricsRegistry>>,
    /// Reconcile after every successful mutation
    pub reconcile_on_change: bool,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
}

/// Generic acknowledgement body
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiMessage {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            data: None,
        }
    }
}

/// Handler error carrying a taxonomy kind
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DuplicatePath => StatusCode::CONFLICT,
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(kind = %kind, error = %self.0, "Request failed");
        } else {
            debug!(kind = %kind, error = %self.0, "Request rejected");
        }
        let body = ErrorBody {
            kind,
            detail: self.0.detail(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/metrics", get(metrics_handler))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/reload", post(reload))
        .route("/api/health", get(health_status))
        .route("/api/health/statistics", get(health_statistics))
        .route("/api/health/check", post(health_check_now))
        .route("/api/monitor/status", get(monitor_status))
        .route("/api/proxy/status", get(proxy_status))
        .route("/api/config/validate", get(validate_config))
        .route("/api/config/backups", get(list_backups))
        .route("/api/config/restore/:name", post(restore_backup))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// HTTP server for the API
pub struct ApiServer {
    state: AppState,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(state: AppState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(listen_addr = %self.listen_addr, "Starting HTTP server");

        let app = router(self.state);
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn run_reconcile(state: &AppState) -> ReconcileResult {
    let result = state.reconciler.reconcile().await;
    if let Some(metrics) = &state.metrics {
        metrics.record_reconcile(&result);
    }
    result
}

/// Bookkeeping after a successful store mutation. A failed reconcile does
/// not undo the mutation.
async fn after_mutation(state: &AppState, op: &str) {
    if let Some(metrics) = &state.metrics {
        metrics.record_mutation(op);
    }
    if state.reconcile_on_change {
        let result = run_reconcile(state).await;
        if !result.success {
            warn!(op, state = %result.state, "Reconcile after mutation failed: {}", result.message);
        }
    }
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "proxy-manager",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(metrics) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    // Gauges reflect the poller at scrape time
    match state.poller.statistics() {
        Ok(stats) => metrics.update_backends(&stats),
        Err(e) => warn!(error = %e, "Failed to refresh backend gauges"),
    }

    match metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.store.list()?))
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Rule>> {
    Ok(Json(state.store.get(&id)?))
}

async fn create_rule(
    State(state): State<AppState>,
    payload: Result<Json<NewRule>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let Json(candidate) = payload?;
    let rule = state.store.add(candidate)?;
    info!(rule_id = %rule.id, path = %rule.path, target = %rule.target(), "Rule created");
    after_mutation(&state, "add").await;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RuleUpdate>, JsonRejection>,
) -> ApiResult<Json<Rule>> {
    let Json(changes) = payload?;
    let rule = state.store.update(&id, changes)?;
    info!(rule_id = %rule.id, "Rule updated");
    after_mutation(&state, "update").await;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiMessage>> {
    let removed = state.store.delete(&id)?;
    info!(rule_id = %removed.id, path = %removed.path, "Rule deleted");
    after_mutation(&state, "delete").await;
    Ok(Json(ApiMessage {
        data: Some(serde_json::to_value(&removed).map_err(Error::from)?),
        ..ApiMessage::ok(format!("rule {} deleted", removed.id))
    }))
}

async fn reload(State(state): State<AppState>) -> (StatusCode, Json<ReconcileResult>) {
    let result = run_reconcile(&state).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result))
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    rule_id: Option<String>,
}

async fn health_status(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = match query.rule_id {
        Some(id) => serde_json::to_value(state.poller.status_of(&id)?),
        None => serde_json::to_value(state.poller.status_all()?),
    }
    .map_err(Error::from)?;
    Ok(Json(value))
}

async fn health_statistics(State(state): State<AppState>) -> ApiResult<Json<healthcheck::HealthStatistics>> {
    Ok(Json(state.poller.statistics()?))
}

async fn health_check_now(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<healthcheck::HealthCheckResult>>> {
    Ok(Json(state.poller.check_all().await?))
}

async fn monitor_status(State(state): State<AppState>) -> ApiResult<Json<healthcheck::MonitorReport>> {
    Ok(Json(state.poller.monitor_report()?))
}

async fn proxy_status(State(state): State<AppState>) -> Json<reconciler::ProxyStatus> {
    Json(state.reconciler.status().await)
}

async fn validate_config(State(state): State<AppState>) -> Json<ApiMessage> {
    let report = state.store.validate();
    if report.valid {
        Json(ApiMessage::ok("rules document is valid"))
    } else {
        Json(ApiMessage {
            success: false,
            message: "rules document is invalid".to_string(),
            error: report.diagnostic,
            data: None,
        })
    }
}

async fn list_backups(State(state): State<AppState>) -> ApiResult<Json<Vec<SnapshotInfo>>> {
    Ok(Json(state.store.list_snapshots()?))
}

async fn restore_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ApiMessage>> {
    state.store.restore_snapshot(&name)?;
    info!(snapshot = %name, "Rules restored from snapshot");
    after_mutation(&state, "restore").await;
    Ok(Json(ApiMessage::ok(format!("restored from {}", name))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::DuplicatePath), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::SyntaxError), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::InvalidState), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ApiError(Error::duplicate_path("path /api already exists")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.kind, ErrorKind::DuplicatePath);
        assert!(body.detail.contains("/api"));
    }
}
