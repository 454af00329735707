//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = ctx.config.jobs.max_inline_bytes;

    let api = Router::new()
        .route("/transcode", post(routes::transcode::transcode_json))
        .route(
            "/transcode/upload",
            post(routes::transcode::transcode_upload)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/jobs/{id}",
            get(routes::jobs::get_job).delete(routes::jobs::cancel_job),
        )
        .route("/stats", get(routes::jobs::stats));

    Router::new()
        .route("/", get(routes::health::banner))
        .route("/health", get(routes::health::health_check))
        .route("/ready", get(routes::health::readiness))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
