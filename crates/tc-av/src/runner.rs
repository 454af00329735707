//! The transcoder port and its ffmpeg implementation.
//!
//! The coordinator only sees [`TranscodeRunner`]; tests substitute
//! deterministic mocks for [`FfmpegRunner`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tc_core::config::Config;
use tc_core::{Container, FailureReason, JobSpec};
use tokio_util::sync::CancellationToken;

use crate::args::build_ffmpeg_args;
use crate::process::{ProcessReport, ResourceLimits, SupervisedProcess};
use crate::relay::{BoxReader, BoxWriter, RelayError};
use crate::tools::ToolRegistry;

/// Terminal classification of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

/// Everything a runner reports back about one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub bytes_out: u64,
    pub stderr_excerpt: String,
    pub elapsed: Duration,
}

impl RunResult {
    /// Result for a run that never got as far as a process.
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            outcome: RunOutcome::Failed(reason),
            exit_code: None,
            bytes_out: 0,
            stderr_excerpt: String::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: RunOutcome::Cancelled,
            exit_code: None,
            bytes_out: 0,
            stderr_excerpt: String::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// How a job's input reaches the transcoder.
pub enum MediaInput {
    /// Relayed into the transcoder's stdin.
    Stream(BoxReader),
    /// A local file the service staged itself. The transcoder opens it
    /// directly and may seek in it.
    File(PathBuf),
}

impl MediaInput {
    /// A reader over the input, whichever form it takes.
    pub async fn into_reader(self) -> std::io::Result<BoxReader> {
        match self {
            Self::Stream(reader) => Ok(reader),
            Self::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }
}

/// Runs one job to completion.
///
/// Implementations must return promptly once `cancel` fires and must not
/// report [`RunOutcome::Cancelled`] unless `cancel` was actually observed.
#[async_trait]
pub trait TranscodeRunner: Send + Sync {
    async fn run(
        &self,
        spec: &JobSpec,
        input: MediaInput,
        output: BoxWriter,
        cancel: CancellationToken,
    ) -> RunResult;
}

/// [`TranscodeRunner`] backed by an ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    ffmpeg: PathBuf,
    grace: Duration,
    limits: ResourceLimits,
    buffer_budget: usize,
    stderr_capacity: usize,
}

impl FfmpegRunner {
    pub fn new(ffmpeg: PathBuf, config: &Config) -> Self {
        Self {
            ffmpeg,
            grace: config.jobs.termination_grace(),
            limits: ResourceLimits::from(&config.limits),
            buffer_budget: config.jobs.buffer_budget_bytes,
            stderr_capacity: config.jobs.stderr_excerpt_bytes,
        }
    }

    /// Build a runner from the discovered `ffmpeg`.
    pub fn from_registry(tools: &ToolRegistry, config: &Config) -> tc_core::Result<Self> {
        let ffmpeg = tools.require("ffmpeg")?;
        Ok(Self::new(ffmpeg.path.clone(), config))
    }

    pub fn program(&self) -> &Path {
        &self.ffmpeg
    }

    fn command(&self, spec: &JobSpec, input: Option<&Path>) -> SupervisedProcess {
        let mut cmd = SupervisedProcess::new(self.ffmpeg.clone());
        cmd.args(build_ffmpeg_args(&spec.format, input))
            .grace(self.grace)
            .limits(self.limits)
            .buffer_budget(self.buffer_budget)
            .stderr_capacity(self.stderr_capacity);
        cmd
    }
}

#[async_trait]
impl TranscodeRunner for FfmpegRunner {
    async fn run(
        &self,
        spec: &JobSpec,
        input: MediaInput,
        output: BoxWriter,
        cancel: CancellationToken,
    ) -> RunResult {
        let (path, stdin) = match input {
            MediaInput::Stream(reader) => (None, Some(reader)),
            MediaInput::File(path) => (Some(path), None),
        };
        tracing::info!(
            job_id = %spec.id,
            format = %spec.format,
            input = %path.as_deref().map_or("stdin".into(), |p| p.display().to_string()),
            "starting ffmpeg"
        );

        let process = self.command(spec, path.as_deref());
        let report = match process.run(stdin, output, &cancel).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(job_id = %spec.id, "ffmpeg did not run: {e}");
                return RunResult::failed(FailureReason::Transcode {
                    exit_code: None,
                    stderr_excerpt: e.to_string(),
                });
            }
        };

        let outcome = classify(&report, spec.format.container, cancel.is_cancelled());
        RunResult {
            outcome,
            exit_code: report.exit_code,
            bytes_out: report.bytes_out(),
            stderr_excerpt: report.stderr.excerpt(),
            elapsed: report.elapsed,
        }
    }
}

/// Decide the terminal outcome of a finished process.
///
/// Order: caller cancellation, relay I/O failure, exit status, then the
/// shape of the output.
pub fn classify(report: &ProcessReport, container: Container, cancelled: bool) -> RunOutcome {
    let excerpt = report.stderr.excerpt();

    if cancelled
        && (report.terminated || matches!(report.drain, Err(RelayError::Cancelled { .. })))
    {
        return RunOutcome::Cancelled;
    }

    for relayed in [&report.feed, &report.drain] {
        if let Err(RelayError::Io { side, source, .. }) = relayed {
            return RunOutcome::Failed(FailureReason::Io {
                side: *side,
                message: source.to_string(),
            });
        }
    }

    let transcode = |detail: Option<&str>| {
        let stderr_excerpt = match (detail, excerpt.is_empty()) {
            (Some(d), true) => d.to_string(),
            (Some(d), false) => format!("{d}: {excerpt}"),
            (None, _) => excerpt.clone(),
        };
        RunOutcome::Failed(FailureReason::Transcode {
            exit_code: report.exit_code,
            stderr_excerpt,
        })
    };

    if !report.success {
        return transcode(None);
    }
    if report.drain.is_err() {
        return transcode(Some("output stream was not closed"));
    }
    if report.bytes_out() == 0 {
        return transcode(Some("empty output"));
    }
    if !container.matches_signature(&report.head) {
        return transcode(Some("output is not a valid stream for the container"));
    }
    RunOutcome::Succeeded
}
