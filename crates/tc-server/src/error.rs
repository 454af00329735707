//! Error-to-HTTP response conversion.
//!
//! Wraps [`tc_core::Error`] so route handlers can return `Result<_, AppError>`
//! and have every failure rendered as `{error, code, request_id}` JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tc_core::JobId;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: tc_core::Error,
    request_id: Option<String>,
    job_id: Option<JobId>,
}

impl AppError {
    pub fn new(inner: tc_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
            job_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn inner(&self) -> &tc_core::Error {
        &self.inner
    }
}

impl From<tc_core::Error> for AppError {
    fn from(e: tc_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() && !self.inner.is_retryable() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let mut body = json!({
            "error": self.inner.to_string(),
            "code": self.inner.code(),
            "request_id": self.request_id,
        });
        if let Some(job_id) = self.job_id {
            body["job_id"] = json!(job_id);
        }
        if let tc_core::Error::Overloaded { running, queued } = self.inner {
            body["running"] = json!(running);
            body["queued"] = json!(queued);
        }

        (status, axum::Json(body)).into_response()
    }
}
