/// Health Probes
///
/// Three read-only endpoints on their own port, kept apart from the data
/// API so orchestrator probes survive API load:
/// - GET /healthz  liveness plus a meta snapshot (tips, lag, uptime)
/// - GET /ready    200 iff the store answers a SELECT
/// - GET /metrics  Prometheus text format
///
/// Probes never write and never call the chain; they read the snapshot the
/// engine publishes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::metrics::Metrics;
use crate::store::{BlockStore, PgStore};
use crate::sync::{EngineStatus, SharedStatus};

pub struct ProbeContext<S = PgStore> {
    pub store: Arc<S>,
    pub metrics: Arc<Metrics>,
    pub status: SharedStatus,
    pub started_at: Instant,
}

pub fn router<S: BlockStore + 'static>(ctx: Arc<ProbeContext<S>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<S>))
        .route("/ready", get(ready::<S>))
        .route("/metrics", get(metrics_text::<S>))
        .with_state(ctx)
}

async fn healthz<S: BlockStore>(State(ctx): State<Arc<ProbeContext<S>>>) -> impl IntoResponse {
    let database_ok = ctx.store.healthcheck().await.is_ok();
    let snapshot = ctx
        .status
        .read()
        .ok()
        .map(|s| EngineStatus::clone(&s))
        .unwrap_or_default();

    let lag = snapshot
        .chain_tip
        .saturating_sub(snapshot.local_tip.unwrap_or(0));
    let rpc_ok = snapshot.chain_tip > 0;
    let healthy = database_ok;

    let body = json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "checks": {
            "database": if database_ok { "ok" } else { "error" },
            "rpc": if rpc_ok { "ok" } else { "unknown" },
            "sync": {
                "state": snapshot.state,
                "lag": lag,
                "localMax": snapshot.local_tip,
                "chainMax": snapshot.chain_tip,
            },
        },
        "lastSyncAt": snapshot.last_sync_at,
        "lastError": snapshot.last_error,
        "consecutiveFailures": snapshot.consecutive_failures,
        "uptimeSeconds": ctx.started_at.elapsed().as_secs(),
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    ctx.metrics
        .http_requests
        .with_label_values(&["/healthz", code.as_str()])
        .inc();
    (code, Json(body))
}

async fn ready<S: BlockStore>(State(ctx): State<Arc<ProbeContext<S>>>) -> impl IntoResponse {
    let code = match ctx.store.healthcheck().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    ctx.metrics
        .http_requests
        .with_label_values(&["/ready", code.as_str()])
        .inc();
    code
}

async fn metrics_text<S: BlockStore>(State(ctx): State<Arc<ProbeContext<S>>>) -> impl IntoResponse {
    ctx.metrics
        .http_requests
        .with_label_values(&["/metrics", "200"])
        .inc();
    ctx.metrics.gather()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{EngineState, EngineStatus};
    use crate::testing::MemStore;
    use std::sync::RwLock;

    fn context() -> Arc<ProbeContext<MemStore>> {
        Arc::new(ProbeContext {
            store: Arc::new(MemStore::new()),
            metrics: Arc::new(Metrics::new().unwrap()),
            status: Arc::new(RwLock::new(EngineStatus::default())),
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn healthz_reports_sync_snapshot() {
        let ctx = context();
        {
            let mut status = ctx.status.write().unwrap();
            status.state = EngineState::Tail;
            status.chain_tip = 120;
            status.local_tip = Some(100);
        }

        let response = healthz(State(Arc::clone(&ctx))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["sync"]["lag"], 20);
        assert_eq!(body["checks"]["sync"]["chainMax"], 120);
        assert_eq!(body["checks"]["database"], "ok");
    }

    #[tokio::test]
    async fn ready_is_ok_with_reachable_store() {
        let response = ready(State(context())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let ctx = context();
        ctx.metrics.blocks_indexed.inc();
        let response = metrics_text(State(ctx)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("chainsync_blocks_indexed_total 1"));
    }
}
