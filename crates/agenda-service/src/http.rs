//! The storage service's minimal HTTP surface: `/raft/status`, used by the
//! front-door client to discover the current leader per spec.md §6. Built
//! with `axum` + `tower-http`'s tracing layer, this workspace's convention
//! for HTTP surfaces wherever one is needed alongside a bus/gRPC service.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::dispatch::DomainService;

pub fn router(service: Arc<DomainService>) -> Router {
    Router::new()
        .route("/raft/status", get(raft_status))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn raft_status(State(service): State<Arc<DomainService>>) -> Json<serde_json::Value> {
    let status = service.raft_status().await;
    Json(serde_json::json!({
        "status": "success",
        "id": status.id,
        "state": status.state,
        "leader": status.leader,
    }))
}
