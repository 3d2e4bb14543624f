//! REST API module using Axum
//!
//! Thin HTTP surface over [`crate::service::GuardService`]: multipart CSV
//! upload for prediction, monitoring analysis, sample deletion, manual
//! retrain and health.

pub mod envelope;
pub mod handlers;
mod routes;

pub use envelope::ApiError;
pub use routes::api_routes;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::GuardService;

/// Create the complete application router.
///
/// CORS is fully permissive; the dashboard is served from another origin.
pub fn create_app(service: GuardService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_routes(service)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
