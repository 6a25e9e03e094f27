use crate::{handlers, AppState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Creates the Axum router and associates routes with handlers.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/images", get(handlers::list_images).post(handlers::create_image))
        .route("/api/images/{key}", get(handlers::get_image).delete(handlers::delete_image))
        .route("/api/admin/cache/invalidate", post(handlers::invalidate_cache))
        .route("/api/downloads/{slug}", post(handlers::start_download))
        .route("/api/gates/{id}", get(handlers::gate_status).delete(handlers::close_gate))
        .route("/api/gates/{id}/open", post(handlers::open_gate))
        .route("/api/gates/{id}/outcome", post(handlers::report_outcome))
        // The static front-end is served from another origin.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
