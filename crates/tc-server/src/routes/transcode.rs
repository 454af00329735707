//! Transcode route handlers.
//!
//! Both endpoints block until the job settles. Inline output is streamed back
//! from the spool file; stored output is answered with a JSON reference. The
//! job is tied to the request: if the client goes away before the job
//! settles, the handler future is dropped and the job is cancelled.

use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use serde::Deserialize;
use tc_core::{Codec, Container, Error, FormatParams, OutputTarget, QualityTier};
use tc_jobs::{FormatPreset, JobOutcome, OutputRef, TranscodeRequest};
use tokio_util::io::ReaderStream;

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;

pub static X_JOB_ID: HeaderName = HeaderName::from_static("x-job-id");
pub static X_EXIT_CODE: HeaderName = HeaderName::from_static("x-exit-code");

/// Query string of the raw upload endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub container: Option<Container>,
    pub codec: Option<Codec>,
    pub quality: Option<QualityTier>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub preset: Option<FormatPreset>,
    pub deadline_secs: Option<u64>,
    /// Store the output under this key instead of streaming it back.
    pub output_key: Option<String>,
    pub job_id: Option<String>,
}

impl UploadParams {
    fn into_request(self, payload: Bytes) -> Result<TranscodeRequest, Error> {
        let format = match (self.container, self.codec) {
            (Some(container), Some(codec)) => Some(FormatParams {
                container,
                codec,
                quality: self.quality.unwrap_or_default(),
                sample_rate: self.sample_rate,
                channels: self.channels,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::validation(
                    "container and codec must be given together",
                ))
            }
        };

        Ok(TranscodeRequest {
            payload: Some(payload),
            format,
            preset: self.preset,
            output: match self.output_key {
                Some(key) => OutputTarget::Stored { key },
                None => OutputTarget::Inline,
            },
            deadline_secs: self.deadline_secs,
            job_id: self.job_id,
            ..Default::default()
        })
    }
}

/// POST /api/transcode
pub async fn transcode_json(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<TranscodeRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let result = match payload {
        Ok(Json(req)) => run_transcode(&ctx, req).await,
        Err(rejection) => Err(Error::validation(rejection.body_text()).into()),
    };
    result.map_err(|e| e.with_request_id(request_id.0))
}

/// POST /api/transcode/upload
pub async fn transcode_upload(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    params: Result<Query<UploadParams>, QueryRejection>,
    body: Bytes,
) -> Result<Response, AppError> {
    let result = match params {
        Ok(Query(params)) => match params.into_request(body) {
            Ok(req) => run_transcode(&ctx, req).await,
            Err(e) => Err(e.into()),
        },
        Err(rejection) => Err(Error::validation(rejection.body_text()).into()),
    };
    result.map_err(|e| e.with_request_id(request_id.0))
}

async fn run_transcode(ctx: &AppContext, req: TranscodeRequest) -> Result<Response, AppError> {
    let spec = ctx.builder.build(req)?;
    let container = spec.format.container;
    let handle = ctx.coordinator.submit(spec)?;
    let job_id = handle.id();

    let mut guard = ctx.coordinator.guard(job_id);
    let outcome = handle.wait().await.map_err(|e| AppError::new(e).with_job_id(job_id))?;
    guard.disarm();

    respond(outcome, container).await
}

async fn respond(outcome: JobOutcome, container: Container) -> Result<Response, AppError> {
    let job_id = outcome.job_id;
    if let Err(e) = outcome.state.to_result() {
        tracing::info!(job_id = %job_id, state = %outcome.state, "Transcode did not succeed");
        return Err(AppError::new(e).with_job_id(job_id));
    }
    let exit_code = outcome.exit_code.unwrap_or_default().to_string();

    match outcome.output {
        Some(OutputRef::Spooled(spool)) => {
            let file = tokio::fs::File::open(&**spool)
                .await
                .map_err(|e| AppError::new(Error::Internal(format!("spool file: {e}"))))?;
            let length = file
                .metadata()
                .await
                .map(|m| m.len())
                .unwrap_or(outcome.bytes_out);

            // The spool file is deleted once the last reference goes away.
            let stream = ReaderStream::with_capacity(file, 64 * 1024).map(move |chunk| {
                let _spool = &spool;
                chunk
            });

            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, container.content_type().to_string()),
                    (header::CONTENT_LENGTH, length.to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("inline; filename=\"{job_id}.{}\"", container.extension()),
                    ),
                    (X_JOB_ID.clone(), job_id.to_string()),
                    (X_EXIT_CODE.clone(), exit_code),
                ],
                Body::from_stream(stream),
            )
                .into_response())
        }
        Some(OutputRef::Stored { key, .. }) => Ok((
            StatusCode::CREATED,
            [(X_JOB_ID.clone(), job_id.to_string())],
            Json(serde_json::json!({
                "job_id": job_id,
                "state": outcome.state.name(),
                "output": { "kind": "stored", "key": key },
                "bytes_out": outcome.bytes_out,
                "exit_code": outcome.exit_code,
                "run_time_ms": outcome.run_time.as_millis() as u64,
            })),
        )
            .into_response()),
        None => Err(AppError::new(Error::Internal(format!(
            "job {job_id} succeeded without output"
        )))
        .with_job_id(job_id)),
    }
}
