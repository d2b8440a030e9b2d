// Read API
//
// GET-only JSON surface over the store. Holds a read handle to the same
// pool the engine writes through; handlers never write and never call the
// chain. Each domain lives in its own submodule.

pub mod blocks;
pub mod helpers;
pub mod transfers;
pub mod types;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::constants::PROCESSOR_NAME;
use crate::metrics::Metrics;
use crate::store::PgStore;
use crate::sync::{EngineStatus, SharedStatus};

use self::helpers::{internal_error, ApiResult};
use self::types::StatusView;

pub struct ApiContext {
    pub store: Arc<PgStore>,
    pub status: SharedStatus,
    pub metrics: Arc<Metrics>,
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/blocks", get(blocks::list_blocks))
        .route("/api/v1/blocks/{id}", get(blocks::get_block))
        .route("/api/v1/transfers", get(transfers::list_transfers))
        .layer(cors)
        .with_state(ctx)
}

/// GET /api/v1/status
/// Engine snapshot plus the persisted sync-status row.
async fn status(State(ctx): State<Arc<ApiContext>>) -> ApiResult<StatusView> {
    let snapshot = ctx
        .status
        .read()
        .ok()
        .map(|s| EngineStatus::clone(&s))
        .unwrap_or_default();
    let persisted = ctx
        .store
        .get_sync_status(PROCESSOR_NAME)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    ctx.metrics
        .http_requests
        .with_label_values(&["/api/v1/status", "200"])
        .inc();
    Ok(Json(StatusView {
        state: snapshot.state,
        chain_tip: snapshot.chain_tip,
        local_tip: snapshot.local_tip,
        target_block: snapshot.target_block,
        lag: snapshot
            .chain_tip
            .saturating_sub(snapshot.local_tip.unwrap_or(0)),
        last_sync_at: snapshot.last_sync_at,
        last_error: snapshot.last_error,
        processor: persisted,
    }))
}
