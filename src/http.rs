//! Snapshot HTTP surface.
//!
//! Two endpoints: a liveness check and the per-chain position snapshot,
//! sorted ascending by min health score with no-debt entries suppressed.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use liquidator_core::ChainManager;

pub fn router(manager: Arc<ChainManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/liquidation/allPositions", get(all_positions))
        .with_state(manager)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

#[derive(Deserialize)]
struct PositionsQuery {
    #[serde(rename = "chainId")]
    chain_id: Option<u64>,
}

async fn all_positions(
    State(manager): State<Arc<ChainManager>>,
    Query(query): Query<PositionsQuery>,
) -> Response {
    let chain_id = query.chain_id.unwrap_or(8453);

    let Some(monitor) = manager.monitor(chain_id) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Monitor not initialized for chain {chain_id}")})),
        )
            .into_response();
    };

    info!(chain_id, "Serving all positions");

    let positions: Vec<_> = monitor
        .accounts_by_health_score()
        .into_iter()
        .filter(|entry| entry.health_score.is_finite())
        .collect();

    Json(positions).into_response()
}
