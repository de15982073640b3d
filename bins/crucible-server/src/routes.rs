use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::{handlers, ws, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/jobs", post(handlers::create_job))
        .route("/api/jobs/{job_id}", get(handlers::get_job))
        .route("/healthz", get(handlers::health_check))
        .route("/ws/execute", get(ws::ws_execute))
}
