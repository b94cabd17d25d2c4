//! Axum router configuration

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{
    extract, health_check, progress, version_check, X_EXTRACTION_ID, X_EXTRACTION_WARNING,
    X_STOP_REASON,
};

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.extractor.limits.max_request_size_bytes();
    let cors_enabled = state.config.cors_enabled;

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version_check))
        .route("/progress", get(progress))
        .route(
            "/extract",
            post(extract).layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(TraceLayer::new_for_http());

    let router = if cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    };

    router.with_state(state)
}

fn cors_layer() -> CorsLayer {
    // Browsers only expose non-safelisted response headers when told to
    let exposed: [HeaderName; 4] = [
        header::CONTENT_DISPOSITION,
        X_EXTRACTION_ID,
        X_STOP_REASON,
        X_EXTRACTION_WARNING,
    ];

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::ORIGIN])
        .expose_headers(exposed)
        .max_age(Duration::from_secs(3600))
}
