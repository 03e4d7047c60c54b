// Route table for the Gradebox worker

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/executions/:id/cancel", post(handlers::cancel_execution))
        .route("/validate", post(handlers::validate))
        .route("/languages", get(handlers::list_languages))
        .route("/admin/images/rebuild", post(handlers::rebuild_images))
        .route("/admin/sandboxes/cleanup", post(handlers::cleanup_sandboxes))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
}
