//! Unified error type for the transcoding service.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which end of a byte relay failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySide {
    /// The side bytes are read from (request body, fetched URI, process stdout).
    Source,
    /// The side bytes are written to (process stdin, spool file, store).
    Sink,
}

impl fmt::Display for RelaySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Unified error type covering all failure modes of a transcode request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request data failed validation. Raised before any resource is allocated.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The wait queue is full; the caller should back off and retry.
    #[error("Overloaded: {running} running, {queued} queued")]
    Overloaded {
        /// Jobs holding a resource slot when the submission was rejected.
        running: usize,
        /// Jobs waiting in the queue when the submission was rejected.
        queued: usize,
    },

    /// The transcoder exited unsuccessfully or produced malformed output.
    #[error("Transcode error (exit code {exit_code:?}): {excerpt}")]
    Transcode {
        /// Process exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Bounded tail of the transcoder's standard error.
        excerpt: String,
    },

    /// The job did not finish before its deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The job was cancelled by the caller or by shutdown.
    #[error("Cancelled")]
    Cancelled,

    /// Reading the source or writing the sink failed.
    #[error("IO error [{side}]: {message}")]
    Io {
        /// The relay side that failed.
        side: RelaySide,
        /// Human-readable error description.
        message: String,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An external tool could not be located or started.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Overloaded { .. } => 503,
            Error::Transcode { .. } => 502,
            Error::DeadlineExceeded => 504,
            Error::Cancelled => 499,
            Error::Io { side: RelaySide::Source, .. } => 502,
            Error::Io { side: RelaySide::Sink, .. } => 500,
            Error::NotFound { .. } => 404,
            Error::Conflict(_) => 409,
            Error::Tool { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Overloaded { .. } => "overloaded",
            Error::Transcode { .. } => "transcode_error",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Cancelled => "cancelled",
            Error::Io { .. } => "io_error",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Tool { .. } => "tool_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether a caller may retry the same request later and expect a
    /// different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Overloaded { .. } | Error::DeadlineExceeded | Error::Io { .. }
        )
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Io`].
    pub fn io(side: RelaySide, message: impl fmt::Display) -> Self {
        Error::Io {
            side,
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
