//! Job specification and lifecycle state.
//!
//! A [`JobSpec`] is produced once by the descriptor builder and never mutated.
//! [`JobState`] only moves forward: `Queued -> Running -> terminal`, or
//! `Queued -> Cancelled`.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, RelaySide, Result};
use crate::ids::JobId;
use crate::media::FormatParams;

/// Default job deadline when the caller does not provide one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Source / output
// ---------------------------------------------------------------------------

/// Where a job reads its input from.
#[derive(Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Payload carried in the request itself.
    Inline(Bytes),
    /// Absolute URI with an allow-listed scheme.
    Remote(String),
}

impl SourceLocator {
    /// Short description safe for logs and status bodies.
    pub fn describe(&self) -> String {
        match self {
            Self::Inline(bytes) => format!("inline ({} bytes)", bytes.len()),
            Self::Remote(uri) => uri.clone(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline(_))
    }
}

impl fmt::Debug for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(bytes) => f.debug_tuple("Inline").field(&bytes.len()).finish(),
            Self::Remote(uri) => f.debug_tuple("Remote").field(uri).finish(),
        }
    }
}

/// Where a job's output goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputTarget {
    /// Streamed back to the caller.
    #[default]
    Inline,
    /// Written through the media store under `key`.
    Stored { key: String },
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// Immutable description of one transcode job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub source: SourceLocator,
    pub format: FormatParams,
    pub output: OutputTarget,
    pub created_at: DateTime<Utc>,
    /// Wall-clock budget measured from the moment the job starts running.
    pub deadline: Duration,
}

impl JobSpec {
    /// Spec with a fresh id, inline output and the default deadline.
    pub fn new(source: SourceLocator, format: FormatParams) -> Self {
        Self {
            id: JobId::new(),
            source,
            format,
            output: OutputTarget::Inline,
            created_at: Utc::now(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    DeadlineExceeded,
    Transcode {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    Io {
        side: RelaySide,
        message: String,
    },
}

impl FailureReason {
    /// Equivalent [`Error`] for callers that want a `Result`.
    pub fn to_error(&self) -> Error {
        match self {
            Self::DeadlineExceeded => Error::DeadlineExceeded,
            Self::Transcode {
                exit_code,
                stderr_excerpt,
            } => Error::Transcode {
                exit_code: *exit_code,
                excerpt: stderr_excerpt.clone(),
            },
            Self::Io { side, message } => Error::io(*side, message),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Transcode { exit_code, .. } => match exit_code {
                Some(code) => write!(f, "transcoder exited with code {code}"),
                None => write!(f, "transcoder terminated by signal"),
            },
            Self::Io { side, message } => write!(f, "{side} i/o error: {message}"),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` respects the forward-only order.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Succeeded | Self::Failed(_) | Self::Cancelled) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting any transition that would revisit a state.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(Error::Internal(format!(
                "illegal job state transition {} -> {}",
                self.name(),
                next.name()
            )));
        }
        *self = next;
        Ok(())
    }

    /// Map a terminal state onto `Ok(())` or its error.
    pub fn to_result(&self) -> Result<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(reason) => Err(reason.to_error()),
            Self::Cancelled => Err(Error::Cancelled),
            Self::Queued | Self::Running => Err(Error::Internal(format!(
                "job is still {}",
                self.name()
            ))),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}
