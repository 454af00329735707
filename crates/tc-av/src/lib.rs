//! # tc-av
//!
//! Transcoder process management for the transcoding service.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache the path to
//!   ffmpeg.
//! - **Argument building** ([`args`]) -- ffmpeg argument vectors from
//!   validated format parameters only.
//! - **Stream relay** ([`relay`]) -- bounded, cancellable byte copying with
//!   back-pressure.
//! - **Supervised processes** ([`SupervisedProcess`]) -- streamed stdin/stdout,
//!   bounded stderr capture, SIGTERM/SIGKILL escalation, rlimits.
//! - **Runner port** ([`TranscodeRunner`]) -- the interface the job
//!   coordinator drives, with [`FfmpegRunner`] as the production
//!   implementation.

pub mod args;
pub mod process;
pub mod relay;
pub mod ring;
pub mod runner;
pub mod tools;

// ---- Re-exports for convenience ----

pub use args::build_ffmpeg_args;
pub use process::{ProcessReport, ResourceLimits, SupervisedProcess};
pub use relay::{relay, BoxReader, BoxWriter, RelayError};
pub use ring::StderrTail;
pub use runner::{classify, FfmpegRunner, MediaInput, RunOutcome, RunResult, TranscodeRunner};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
