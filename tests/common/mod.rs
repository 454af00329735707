//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`AppContext`] over a
//! temporary spool/output directory and a scripted transcoder. The
//! [`TestHarness::with_server`] constructor starts Axum on a random port for
//! HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tc_av::{BoxWriter, MediaInput, RunOutcome, RunResult, ToolRegistry, TranscodeRunner};
use tc_core::config::Config;
use tc_core::{FailureReason, JobSpec};
use tc_server::context::AppContext;
use tc_server::router::build_router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// First bytes of an ISO-BMFF file; enough for output validation.
pub const MP4_HEAD: &[u8] = b"\0\0\0\x20ftypisom";

/// Transcoder stand-in driven by the first word of the payload:
///
/// - `echo ...` copies the payload to the output
/// - `slow ...` does the same after 200ms
/// - `fail ...` exits 1 with an ffmpeg-like stderr line
/// - `hang ...` blocks until cancelled
#[derive(Default)]
pub struct ScriptedRunner;

#[async_trait]
impl TranscodeRunner for ScriptedRunner {
    async fn run(
        &self,
        _spec: &JobSpec,
        input: MediaInput,
        mut output: BoxWriter,
        cancel: CancellationToken,
    ) -> RunResult {
        let mut payload = Vec::new();
        let read = match input.into_reader().await {
            Ok(mut reader) => reader.read_to_end(&mut payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = read {
            return RunResult::failed(FailureReason::Io {
                side: tc_core::RelaySide::Source,
                message: e.to_string(),
            });
        }
        let word = payload
            .split(|b| *b == b' ')
            .next()
            .unwrap_or_default()
            .to_vec();

        match word.as_slice() {
            b"echo" | b"slow" => {
                if word == b"slow" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                output.write_all(&payload).await.unwrap();
                output.shutdown().await.unwrap();
                RunResult {
                    outcome: RunOutcome::Succeeded,
                    exit_code: Some(0),
                    bytes_out: payload.len() as u64,
                    stderr_excerpt: String::new(),
                    elapsed: Duration::ZERO,
                }
            }
            b"fail" => {
                let excerpt = "pipe:0: Invalid data found when processing input".to_string();
                RunResult {
                    outcome: RunOutcome::Failed(FailureReason::Transcode {
                        exit_code: Some(1),
                        stderr_excerpt: excerpt.clone(),
                    }),
                    exit_code: Some(1),
                    bytes_out: 0,
                    stderr_excerpt: excerpt,
                    elapsed: Duration::ZERO,
                }
            }
            _ => {
                cancel.cancelled().await;
                RunResult::cancelled()
            }
        }
    }
}

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    /// Harness with default configuration and the scripted runner.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness with configuration tweaked by `f` and the scripted runner.
    pub fn with_config(f: impl FnOnce(&mut Config)) -> Self {
        Self::build(f, |_, _| Arc::new(ScriptedRunner))
    }

    /// Harness running a shell script in place of ffmpeg.
    #[cfg(unix)]
    pub fn with_fake_ffmpeg(body: &str, f: impl FnOnce(&mut Config)) -> Self {
        let body = body.to_string();
        Self::build(f, move |dir, config| {
            let path = fake_ffmpeg(dir, &body);
            Arc::new(tc_av::FfmpegRunner::new(path, config))
        })
    }

    fn build(
        f: impl FnOnce(&mut Config),
        runner: impl FnOnce(&tempfile::TempDir, &Config) -> Arc<dyn TranscodeRunner>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.storage.spool_dir = Some(dir.path().join("spool"));
        config.storage.output_dir = dir.path().join("out");
        config.jobs.termination_grace_ms = 500;
        f(&mut config);

        let runner = runner(&dir, &config);
        let ctx = AppContext::with_runner(config, ToolRegistry::default(), runner)
            .expect("failed to build context");
        Self { ctx, dir }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.ctx.config.storage.output_dir.clone()
    }

    /// Number of files currently in the spool directory.
    pub fn spool_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("spool"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::new().serve().await
    }

    /// Start an Axum server for this harness on a random port.
    pub async fn serve(self) -> (Self, SocketAddr) {
        let app = build_router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (self, addr)
    }

    /// Poll coordinator stats until `check` holds or two seconds pass.
    pub async fn wait_until(&self, check: impl Fn(&tc_jobs::CoordinatorStats) -> bool) -> bool {
        for _ in 0..200 {
            if check(&self.ctx.coordinator.stats()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[cfg(unix)]
fn fake_ffmpeg(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("ffmpeg");
    let script = format!("#!/bin/sh\n[ \"$1\" = --ready ] && exit 0\n{body}\n");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    // A concurrent fork may briefly hold the write handle (ETXTBSY).
    for _ in 0..50 {
        match std::process::Command::new(&path).arg("--ready").status() {
            Ok(status) if status.success() => return path,
            _ => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    panic!("fake ffmpeg at {} never became executable", path.display());
}
