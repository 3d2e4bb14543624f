//! API route definitions
//!
//! - POST   /predict                           - score an upload, store if validated
//! - GET    /api/monitoring/latest-analysis    - drift metrics for the newest sample
//! - DELETE /monitoring/delete-anomaly         - remove a stored sample by sha256
//! - POST   /api/retrain/:rpm                  - manual retrain
//! - GET    /health                            - per-RPM model status

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use super::handlers;
use crate::config::defaults;
use crate::service::GuardService;

pub fn api_routes(service: GuardService) -> Router {
    Router::new()
        .route(
            "/predict",
            post(handlers::predict).layer(DefaultBodyLimit::max(defaults::MAX_UPLOAD_BYTES)),
        )
        .route("/api/monitoring/latest-analysis", get(handlers::latest_analysis))
        .route("/monitoring/delete-anomaly", delete(handlers::delete_anomaly))
        .route("/api/retrain/:rpm", post(handlers::trigger_retrain))
        .route("/health", get(handlers::health))
        .with_state(service)
}
