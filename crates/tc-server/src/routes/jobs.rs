//! Job status, cancellation and service statistics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tc_core::events::Event;
use tc_core::JobId;
use tc_jobs::{CoordinatorStats, JobStatus};

use crate::context::AppContext;
use crate::error::AppError;

fn parse_job_id(id: &str) -> Result<JobId, AppError> {
    id.parse()
        .map_err(|_| tc_core::Error::Validation("Invalid job ID".into()).into())
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(ctx.coordinator.status(job_id)?))
}

/// DELETE /api/jobs/{id}
///
/// Queued jobs are cancelled on the spot; running jobs are signalled and the
/// returned status may still read `running`.
pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = parse_job_id(&id)?;
    ctx.coordinator.cancel(job_id)?;
    let status = ctx.coordinator.status(job_id)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    #[serde(default = "default_events")]
    pub events: usize,
}

fn default_events() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub coordinator: CoordinatorStats,
    pub recent_events: Vec<Event>,
}

/// GET /api/stats
pub async fn stats(
    State(ctx): State<AppContext>,
    Query(params): Query<StatsParams>,
) -> Json<StatsResponse> {
    Json(StatsResponse {
        coordinator: ctx.coordinator.stats(),
        recent_events: ctx.event_bus.recent_events(params.events),
    })
}
