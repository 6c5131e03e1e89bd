pub mod backups;

use crate::state::AppState;
use axum::Json;
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/backups", backups::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Success envelope shared by every endpoint.
pub(crate) fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "result": "ok", "data": data }))
}
