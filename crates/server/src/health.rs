//! Health endpoint with live-session and pool visibility.

use std::sync::Arc;

use axum::{Json, extract::State};
use mcp::GatewayContext;

pub(super) async fn health(State(context): State<Arc<GatewayContext>>) -> Json<serde_json::Value> {
    let sessions = context.session_stats();
    let pools = context.pool_status();

    Json(serde_json::json!({
        "status": "ok",
        "sessions": sessions,
        "pools": pools,
    }))
}
