use axum::{routing::get, Json, Router};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// GET /api/health — liveness probe for deploys and load balancers.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the axum Router: the WebSocket gate plus a health endpoint. All
/// message/channel CRUD lives in upstream services.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/api/health", get(health))
        .with_state(state)
}
