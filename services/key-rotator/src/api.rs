//! HTTP API over the key pool
//!
//! Endpoints:
//! - GET  /keys/next: acquire a key, returns a lease
//! - POST /leases/{lease_id}/release: return a leased key to rotation
//! - GET  /leases/{lease_id}/status: text usage report for the leased key
//! - GET  /leases/{lease_id}/rate-limited: whether the leased key is limited now
//! - POST /pool/rotate: move the head key to the tail
//! - GET  /pool: pool summary
//! - GET  /health: liveness plus pool summary
//! - GET  /metrics: Prometheus exposition
//!
//! A lease is the server-side handle for a granted key. Leases that are never
//! released stay in the table; the key itself is already back in rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{Error as PoolError, KeyHandle, Pool};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::metrics;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pool: Arc<Pool>,
    leases: Arc<Mutex<HashMap<String, KeyHandle>>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AppState {
    pub fn new(pool: Arc<Pool>, prometheus: PrometheusHandle) -> Self {
        Self {
            pool,
            leases: Arc::new(Mutex::new(HashMap::new())),
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the router with every route and the concurrency limit applied.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/keys/next", get(next_key))
        .route("/leases/{lease_id}/release", post(release_lease))
        .route("/leases/{lease_id}/status", get(lease_status))
        .route("/leases/{lease_id}/rate-limited", get(lease_rate_limited))
        .route("/pool/rotate", post(rotate_pool))
        .route("/pool", get(pool_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn unknown_lease(lease_id: &str) -> Response {
    json(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": format!("unknown lease {lease_id}") }),
    )
}

fn pool_fault(err: &PoolError) -> Response {
    let (status, kind) = match err {
        PoolError::EmptyPool => (StatusCode::INTERNAL_SERVER_ERROR, "empty_pool"),
        _ => (StatusCode::BAD_GATEWAY, "store_error"),
    };
    json(
        status,
        serde_json::json!({ "error": kind, "message": err.to_string() }),
    )
}

/// GET /keys/next: hand out the next available key.
///
/// 200 with a lease on success, 503 with the no-key message when every key
/// is limited or expired, 500/502 on pool faults.
async fn next_key(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let result = state.pool.acquire().await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(Some(key)) => {
            metrics::record_acquire("granted", elapsed);
            let status = state.pool.status(&key).await;
            let lease_id = format!("lease_{}", uuid::Uuid::new_v4().as_simple());
            let key_id = key.id().to_string();

            let active = {
                let mut leases = state.leases.lock().await;
                leases.insert(lease_id.clone(), key);
                leases.len()
            };
            metrics::set_active_leases(active);
            info!(lease_id, key_id, "key leased");

            json(
                StatusCode::OK,
                serde_json::json!({
                    "lease_id": lease_id,
                    "key_id": key_id,
                    "status": status,
                }),
            )
        }
        Ok(None) => {
            metrics::record_acquire("exhausted", elapsed);
            json(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "exhausted",
                    "message": state.pool.format_status(None).await,
                }),
            )
        }
        Err(e) => {
            let outcome = if matches!(e, PoolError::EmptyPool) { "empty" } else { "error" };
            metrics::record_acquire(outcome, elapsed);
            error!(error = %e, "key acquisition failed");
            pool_fault(&e)
        }
    }
}

/// POST /leases/{lease_id}/release: return the leased key to the pool.
///
/// On a store failure the lease is kept so the caller can retry.
async fn release_lease(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
) -> Response {
    let Some(key) = state.leases.lock().await.remove(&lease_id) else {
        return unknown_lease(&lease_id);
    };
    let key_id = key.id().to_string();

    if let Err(e) = state.pool.release(key.clone()).await {
        warn!(lease_id, key_id, error = %e, "release failed, lease kept");
        state.leases.lock().await.insert(lease_id, key);
        return pool_fault(&e);
    }

    let active = state.leases.lock().await.len();
    metrics::set_active_leases(active);
    info!(lease_id, key_id, "lease released");

    json(
        StatusCode::OK,
        serde_json::json!({
            "lease_id": lease_id,
            "key_id": key_id,
            "status": "released",
        }),
    )
}

async fn leased_key(state: &AppState, lease_id: &str) -> Option<KeyHandle> {
    state.leases.lock().await.get(lease_id).cloned()
}

/// GET /leases/{lease_id}/status: plain-text usage report.
async fn lease_status(State(state): State<AppState>, Path(lease_id): Path<String>) -> Response {
    let Some(key) = leased_key(&state, &lease_id).await else {
        return unknown_lease(&lease_id);
    };
    let report = state.pool.format_status(Some(&key)).await;
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        report,
    )
        .into_response()
}

/// GET /leases/{lease_id}/rate-limited
async fn lease_rate_limited(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
) -> Response {
    let Some(key) = leased_key(&state, &lease_id).await else {
        return unknown_lease(&lease_id);
    };
    let rate_limited = state.pool.is_rate_limited(&key).await;
    json(
        StatusCode::OK,
        serde_json::json!({
            "lease_id": lease_id,
            "key_id": key.id(),
            "rate_limited": rate_limited,
        }),
    )
}

/// POST /pool/rotate
async fn rotate_pool(State(state): State<AppState>) -> Response {
    match state.pool.rotate().await {
        Ok(()) => json(StatusCode::OK, serde_json::json!({ "status": "rotated" })),
        Err(e) => {
            warn!(error = %e, "manual rotation failed");
            pool_fault(&e)
        }
    }
}

/// GET /pool
async fn pool_status(State(state): State<AppState>) -> Response {
    json(StatusCode::OK, state.pool.health().await)
}

/// GET /health: 200 while the pool has queued keys, 503 otherwise.
async fn health(State(state): State<AppState>) -> Response {
    let pool = state.pool.health().await;
    let healthy = pool["status"] == "healthy";
    let leases_active = state.leases.lock().await.len();

    json(
        if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        serde_json::json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "leases_active": leases_active,
            "pool": pool,
        }),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeDelta;
    use key_pool::{KeyRecord, ManualClock, RateLimits};
    use tower::ServiceExt;

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn start() -> chrono::DateTime<chrono::Utc> {
        "2024-06-15T12:00:10Z".parse().unwrap()
    }

    fn test_state(records: Vec<KeyRecord>) -> (AppState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let pool = Arc::new(Pool::in_memory(records, clock.clone()));
        (AppState::new(pool, test_prometheus_handle()), clock)
    }

    fn one_per_minute(id: &str) -> KeyRecord {
        KeyRecord::new(
            id,
            RateLimits {
                per_minute: 1,
                ..RateLimits::unlimited()
            },
        )
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn send_json(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, method, uri).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn next_key_grants_lease_with_status() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state.clone(), 10);

        let (status, json) = send_json(&app, "GET", "/keys/next").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["key_id"], "alpha");
        assert!(json["lease_id"].as_str().unwrap().starts_with("lease_"));
        assert_eq!(json["status"]["minute"]["used"], 1);
        assert_eq!(json["status"]["minute"]["remaining"], 0);
        assert_eq!(state.leases.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn next_key_exhausted_returns_503_with_sentinel() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        send_json(&app, "GET", "/keys/next").await;
        let (status, json) = send_json(&app, "GET", "/keys/next").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "exhausted");
        assert_eq!(json["message"], key_pool::NO_KEY_AVAILABLE);
    }

    #[tokio::test]
    async fn next_key_recovers_after_window_rolls_over() {
        let (state, clock) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        send_json(&app, "GET", "/keys/next").await;
        clock.advance(TimeDelta::minutes(1));
        let (status, _) = send_json(&app, "GET", "/keys/next").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn next_key_on_empty_pool_is_server_error() {
        let (state, _) = test_state(vec![]);
        let app = build_router(state, 10);

        let (status, json) = send_json(&app, "GET", "/keys/next").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "empty_pool");
    }

    #[tokio::test]
    async fn release_returns_key_and_forgets_lease() {
        let (state, _) = test_state(vec![KeyRecord::new("alpha", RateLimits::unlimited())]);
        let app = build_router(state.clone(), 10);

        let (_, json) = send_json(&app, "GET", "/keys/next").await;
        let lease_id = json["lease_id"].as_str().unwrap().to_string();

        let (status, json) =
            send_json(&app, "POST", &format!("/leases/{lease_id}/release")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "released");
        assert_eq!(json["key_id"], "alpha");
        assert!(state.leases.lock().await.is_empty());
        assert_eq!(state.pool.len().await.unwrap(), 2);

        let (status, _) = send_json(&app, "POST", &format!("/leases/{lease_id}/release")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lease_status_renders_text_report() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        let (_, json) = send_json(&app, "GET", "/keys/next").await;
        let lease_id = json["lease_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/leases/{lease_id}/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("Key: alpha"), "{body}");
        assert!(body.contains("Per minute: 1/1 used, 0 remaining"), "{body}");
    }

    #[tokio::test]
    async fn lease_rate_limited_reflects_window() {
        let (state, clock) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        let (_, json) = send_json(&app, "GET", "/keys/next").await;
        let lease_id = json["lease_id"].as_str().unwrap().to_string();
        let uri = format!("/leases/{lease_id}/rate-limited");

        let (_, json) = send_json(&app, "GET", &uri).await;
        assert_eq!(json["rate_limited"], true);

        clock.advance(TimeDelta::minutes(1));
        let (_, json) = send_json(&app, "GET", &uri).await;
        assert_eq!(json["rate_limited"], false);
    }

    #[tokio::test]
    async fn unknown_lease_is_404() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);
        let (status, json) = send_json(&app, "GET", "/leases/lease_nope/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("lease_nope"));
    }

    #[tokio::test]
    async fn rotate_changes_next_key() {
        let (state, _) = test_state(vec![
            KeyRecord::new("alpha", RateLimits::unlimited()),
            KeyRecord::new("beta", RateLimits::unlimited()),
        ]);
        let app = build_router(state, 10);

        let (status, json) = send_json(&app, "POST", "/pool/rotate").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "rotated");

        let (_, json) = send_json(&app, "GET", "/keys/next").await;
        assert_eq!(json["key_id"], "beta");
    }

    #[tokio::test]
    async fn health_and_pool_report_queue() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        let (status, json) = send_json(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool"]["keys_queued"], 1);
        assert_eq!(json["leases_active"], 0);

        let (status, json) = send_json(&app, "GET", "/pool").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["backend"], "memory");
    }

    #[tokio::test]
    async fn health_on_empty_pool_is_503() {
        let (state, _) = test_state(vec![]);
        let app = build_router(state, 10);
        let (status, json) = send_json(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let (state, _) = test_state(vec![one_per_minute("alpha")]);
        let app = build_router(state, 10);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
