// Route definitions for the grader API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub const CALLBACK_ROUTE: &str = "/api/v1/plugins/test-runner/callback";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/grade", post(handlers::submit_grading))
        .route("/grade/:attempt_id", get(handlers::get_outcome))
        .route("/progress/:attempt_id/:criterion", get(handlers::get_progress))
        .route(CALLBACK_ROUTE, post(handlers::judge_callback))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
