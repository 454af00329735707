//! Liveness, readiness and service banner.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::context::AppContext;

#[derive(Debug, Serialize)]
pub struct Banner {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// GET /
pub async fn banner(State(ctx): State<AppContext>) -> Json<Banner> {
    Json(Banner {
        name: "transcoded",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
    })
}

/// GET /health
pub async fn health_check() -> &'static str {
    "ok"
}

/// GET /ready
///
/// 503 while the next submission would be rejected.
pub async fn readiness(State(ctx): State<AppContext>) -> impl IntoResponse {
    let stats = ctx.coordinator.stats();
    let ready = !ctx.coordinator.is_saturated();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": ready,
            "running": stats.running,
            "queued": stats.queued,
        })),
    )
}
