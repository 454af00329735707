//! Supervised child process with streamed stdin/stdout.
//!
//! [`SupervisedProcess`] spawns one program, feeds its stdin from a reader,
//! relays its stdout into a writer, and keeps a bounded tail of its stderr.
//! Cancellation sends SIGTERM to the process group, waits for the grace
//! period, then sends SIGKILL.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tc_core::config::LimitsConfig;
use tc_core::SIGNATURE_LEN;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::relay::{relay, BoxReader, BoxWriter, RelayError};
use crate::ring::StderrTail;

/// Default grace period between SIGTERM and SIGKILL.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How long stdout/stderr may stay open after the process has exited.
const STREAM_LINGER: Duration = Duration::from_millis(500);

/// Per-process resource ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_secs: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_memory_bytes.is_none() && self.max_cpu_secs.is_none()
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            max_memory_bytes: cfg.max_memory_bytes,
            max_cpu_secs: cfg.max_cpu_secs,
        }
    }
}

/// What happened to a supervised process.
#[derive(Debug)]
pub struct ProcessReport {
    /// Exit code, `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    /// The process was signalled by us.
    pub terminated: bool,
    /// SIGKILL was needed after the grace period.
    pub forced: bool,
    /// Result of feeding stdin. A broken pipe is reported as `Ok`.
    pub feed: Result<u64, RelayError>,
    /// Result of relaying stdout into the output writer.
    pub drain: Result<u64, RelayError>,
    pub stderr: StderrTail,
    /// Leading bytes of stdout, at most [`SIGNATURE_LEN`].
    pub head: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessReport {
    pub fn bytes_out(&self) -> u64 {
        match &self.drain {
            Ok(n) => *n,
            Err(e) => e.transferred(),
        }
    }
}

/// Builder for a streamed, cancellable process invocation.
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
    limits: ResourceLimits,
    stderr_capacity: usize,
    buffer_budget: usize,
}

impl SupervisedProcess {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            grace: DEFAULT_GRACE,
            limits: ResourceLimits::default(),
            stderr_capacity: 4096,
            buffer_budget: 64 * 1024,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn grace(&mut self, d: Duration) -> &mut Self {
        self.grace = d;
        self
    }

    pub fn limits(&mut self, limits: ResourceLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    pub fn stderr_capacity(&mut self, bytes: usize) -> &mut Self {
        self.stderr_capacity = bytes;
        self
    }

    pub fn buffer_budget(&mut self, bytes: usize) -> &mut Self {
        self.buffer_budget = bytes;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run the process to completion.
    ///
    /// Returns once the process has exited and its streams are closed (or the
    /// linger period after exit ran out). After `cancel` fires this returns
    /// within the grace period plus the linger period. Without `input` the
    /// process gets a null stdin.
    ///
    /// # Errors
    ///
    /// [`tc_core::Error::Tool`] if the process cannot be spawned or waited on.
    pub async fn run(
        &self,
        input: Option<BoxReader>,
        output: BoxWriter,
        cancel: &CancellationToken,
    ) -> tc_core::Result<ProcessReport> {
        let name = self.program_name();
        let started = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
            apply_limits(&mut cmd, self.limits);
        }
        #[cfg(not(unix))]
        {
            if !self.limits.is_empty() {
                tracing::warn!("resource limits are not enforced on this platform");
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| tc_core::Error::tool(&name, format!("failed to spawn: {e}")))?;
        tracing::debug!(program = %name, pid = ?child.id(), "spawned");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(tc_core::Error::tool(&name, "standard streams were not piped"));
        };
        let stdin = child.stdin.take();

        // `kill` stops the process; it fires on caller cancel or a failed relay.
        let kill = cancel.child_token();
        // `feed_stop` also fires once the process has exited.
        let feed_stop = kill.child_token();
        let stderr_stop = CancellationToken::new();
        let drain_done = CancellationToken::new();
        let stderr_done = CancellationToken::new();
        let budget = self.buffer_budget;

        let feed = async {
            let (Some(mut input), Some(mut stdin)) = (input, stdin) else {
                return Ok(0);
            };
            let fed = relay(&mut input, &mut stdin, budget, &feed_stop).await;
            let fed = match fed {
                Ok(n) => match stdin.shutdown().await {
                    Ok(()) => Ok(n),
                    Err(source) => Err(RelayError::Io {
                        side: tc_core::RelaySide::Sink,
                        transferred: n,
                        source,
                    }),
                },
                Err(e) => Err(e),
            };
            drop(stdin);
            match fed {
                Err(e) if e.is_broken_pipe() => {
                    // The program stopped reading; its exit status decides.
                    tracing::debug!(transferred = e.transferred(), "stdin closed early");
                    Ok(e.transferred())
                }
                Err(e @ RelayError::Io { .. }) => {
                    kill.cancel();
                    Err(e)
                }
                other => other,
            }
        };

        let drain = async {
            let mut sink = HeadCapture::new(output, SIGNATURE_LEN);
            let mut stdout = stdout;
            let mut drained = relay(&mut stdout, &mut sink, budget, &kill).await;
            if let Ok(n) = drained {
                if let Err(source) = sink.shutdown().await {
                    kill.cancel();
                    drained = Err(RelayError::Io {
                        side: tc_core::RelaySide::Sink,
                        transferred: n,
                        source,
                    });
                }
            }
            drain_done.cancel();
            (drained, sink.head)
        };

        let capture = async {
            let tail = StderrTail::capture(stderr, self.stderr_capacity, &stderr_stop).await;
            stderr_done.cancel();
            tail
        };

        let supervise = async {
            let (status, terminated, forced) = tokio::select! {
                status = child.wait() => (status, false, false),
                _ = kill.cancelled() => {
                    let (status, forced) = terminate(&mut child, self.grace).await;
                    (status, true, forced)
                }
            };
            feed_stop.cancel();
            tokio::select! {
                _ = async {
                    drain_done.cancelled().await;
                    stderr_done.cancelled().await;
                } => {}
                _ = tokio::time::sleep(STREAM_LINGER) => {
                    tracing::debug!("streams still open after exit");
                    kill.cancel();
                    stderr_stop.cancel();
                }
            }
            (status, terminated, forced)
        };

        let (feed, (drain, head), stderr, (status, terminated, forced)) =
            tokio::join!(feed, drain, capture, supervise);

        let status: ExitStatus =
            status.map_err(|e| tc_core::Error::tool(&name, format!("wait failed: {e}")))?;

        let report = ProcessReport {
            exit_code: status.code(),
            success: status.success(),
            terminated,
            forced,
            feed,
            drain,
            stderr,
            head,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            program = %name,
            exit_code = ?report.exit_code,
            terminated,
            forced,
            bytes_out = report.bytes_out(),
            "process finished"
        );
        Ok(report)
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> (io::Result<ExitStatus>, bool) {
    signal_group(child, false);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => (status, false),
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "process ignored SIGTERM; killing");
            signal_group(child, true);
            let _ = child.start_kill();
            (child.wait().await, true)
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, "killpg({signal:?}) failed: {e}");
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _force: bool) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn apply_limits(cmd: &mut Command, limits: ResourceLimits) {
    if limits.is_empty() {
        return;
    }
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            use nix::sys::resource::{setrlimit, Resource};
            if let Some(bytes) = limits.max_memory_bytes {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)?;
            }
            if let Some(secs) = limits.max_cpu_secs {
                setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(io::Error::from)?;
            }
            Ok(())
        });
    }
}

/// Writer adapter that remembers the first `cap` bytes written through it.
struct HeadCapture<W> {
    inner: W,
    head: Vec<u8>,
    cap: usize,
}

impl<W> HeadCapture<W> {
    fn new(inner: W, cap: usize) -> Self {
        Self {
            inner,
            head: Vec::with_capacity(cap),
            cap,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HeadCapture<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            let want = this.cap.saturating_sub(this.head.len()).min(n);
            this.head.extend_from_slice(&buf[..want]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
