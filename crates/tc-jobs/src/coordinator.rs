//! Job coordinator.
//!
//! Owns admission, the FIFO wait queue, per-job deadlines and cancellation,
//! and the lifecycle state of every job it accepted. All scheduling state sits
//! behind one mutex so that releasing a finished job's slot and admitting the
//! queue head happen atomically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tc_av::{RunOutcome, RunResult, TranscodeRunner};
use tc_core::config::JobsConfig;
use tc_core::events::{EventBus, EventPayload};
use tc_core::{
    Error, FailureReason, FormatParams, JobId, JobSpec, JobState, OutputTarget, RelaySide,
    Result,
};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::slots::{ResourceSlot, SlotPool, SlotStats};
use crate::store::{MediaStore, OpenedSource, OutputRef};

/// Who asked a running job to stop. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Caller,
    Deadline,
    Shutdown,
}

/// Terminal result of a job, delivered through its [`JobHandle`].
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub bytes_out: u64,
    pub stderr_excerpt: String,
    /// Set only for succeeded jobs.
    pub output: Option<OutputRef>,
    /// Time spent running; zero for jobs cancelled while queued.
    pub run_time: Duration,
}

impl JobOutcome {
    fn cancelled_in_queue(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::Cancelled,
            exit_code: None,
            bytes_out: 0,
            stderr_excerpt: String::new(),
            output: None,
            run_time: Duration::ZERO,
        }
    }
}

/// Caller's handle on a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    done: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) -> Result<JobOutcome> {
        let mut done = self.done.clone();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("job {} dropped without an outcome", self.id)))?;
        outcome
            .clone()
            .ok_or_else(|| Error::Internal(format!("job {} has no outcome", self.id)))
    }
}

/// Point-in-time view of one job, as served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    pub source: String,
    pub format: FormatParams,
    pub output: OutputTarget,
    /// 1-based position while queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub deadline_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub bytes_out: u64,
}

/// Aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent_jobs: usize,
    pub max_queue_length: usize,
    pub accepting: bool,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub slots: SlotStats,
}

struct JobEntry {
    spec: Arc<JobSpec>,
    state: JobState,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    bytes_out: u64,
    done: Option<watch::Sender<Option<JobOutcome>>>,
}

impl JobEntry {
    fn settle(&mut self, outcome: JobOutcome) {
        if let Err(e) = self.state.transition(outcome.state.clone()) {
            tracing::error!(job_id = %self.spec.id, "{e}");
        }
        self.finished_at = Some(Utc::now());
        self.exit_code = outcome.exit_code;
        self.bytes_out = outcome.bytes_out;
        if let Some(done) = self.done.take() {
            done.send_replace(Some(outcome));
        }
    }
}

#[derive(Default)]
struct Sched {
    queue: VecDeque<JobId>,
    jobs: HashMap<JobId, JobEntry>,
    finished: VecDeque<JobId>,
    running: usize,
    accepting: bool,
    submitted: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
}

impl Sched {
    /// Remember a terminal job, evicting the oldest beyond `retain`.
    fn retire(&mut self, id: JobId, retain: usize) {
        self.finished.push_back(id);
        while self.finished.len() > retain {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }

    fn overloaded(&self) -> Error {
        Error::Overloaded {
            running: self.running,
            queued: self.queue.len(),
        }
    }
}

struct Inner {
    runner: Arc<dyn TranscodeRunner>,
    store: Arc<dyn MediaStore>,
    pool: SlotPool,
    events: Arc<EventBus>,
    max_queue_length: usize,
    retained_jobs: usize,
    sched: Mutex<Sched>,
    idle: Notify,
}

/// Admits, runs and tracks transcode jobs.
///
/// Cloning is cheap; clones share the same scheduler.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(
        runner: Arc<dyn TranscodeRunner>,
        store: Arc<dyn MediaStore>,
        pool: SlotPool,
        jobs: &JobsConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                store,
                pool,
                events,
                max_queue_length: jobs.max_queue_length,
                retained_jobs: jobs.retained_jobs,
                sched: Mutex::new(Sched {
                    accepting: true,
                    ..Default::default()
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Accept a job: start it now if a slot is free and nobody is waiting,
    /// queue it otherwise, or fail fast with [`Error::Overloaded`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        let inner = &self.inner;
        let mut sched = inner.sched.lock();
        let id = spec.id;

        if !sched.accepting {
            return Err(sched.overloaded());
        }
        if sched.jobs.contains_key(&id) {
            return Err(Error::Conflict(format!("job {id} already exists")));
        }

        let slot = if sched.queue.is_empty() {
            inner.pool.try_acquire()
        } else {
            None
        };
        if slot.is_none() && sched.queue.len() >= inner.max_queue_length {
            sched.rejected += 1;
            inner.events.broadcast(EventPayload::JobRejected { job_id: id });
            tracing::warn!(
                job_id = %id,
                running = sched.running,
                queued = sched.queue.len(),
                "Rejecting job: queue full"
            );
            return Err(sched.overloaded());
        }

        let (done_tx, done_rx) = watch::channel(None);
        sched.jobs.insert(
            id,
            JobEntry {
                spec: Arc::new(spec),
                state: JobState::Queued,
                cancel: CancellationToken::new(),
                reason: Arc::default(),
                started_at: None,
                finished_at: None,
                exit_code: None,
                bytes_out: 0,
                done: Some(done_tx),
            },
        );
        sched.submitted += 1;

        match slot {
            Some(slot) => start(inner, &mut sched, id, slot),
            None => {
                sched.queue.push_back(id);
                let position = sched.queue.len();
                inner.events.broadcast(EventPayload::JobQueued { job_id: id, position });
                tracing::info!(job_id = %id, position, "Job queued");
            }
        }

        Ok(JobHandle { id, done: done_rx })
    }

    /// Cancel a job. Queued jobs are cancelled immediately; running jobs are
    /// signalled and settle once their process has exited.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let inner = &self.inner;
        let mut sched = inner.sched.lock();
        let entry = sched
            .jobs
            .get(&id)
            .ok_or_else(|| Error::not_found("job", id))?;

        match &entry.state {
            JobState::Queued => {
                sched.queue.retain(|queued| *queued != id);
                cancel_queued(inner, &mut sched, id);
                Ok(())
            }
            JobState::Running => {
                let _ = entry.reason.set(CancelReason::Caller);
                entry.cancel.cancel();
                tracing::info!(job_id = %id, "Cancellation requested");
                Ok(())
            }
            terminal => Err(Error::Conflict(format!(
                "job {id} is already {}",
                terminal.name()
            ))),
        }
    }

    /// A guard that cancels `id` when dropped unless disarmed.
    pub fn guard(&self, id: JobId) -> CancelGuard {
        CancelGuard {
            coordinator: self.clone(),
            id,
            armed: true,
        }
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        let sched = self.inner.sched.lock();
        let entry = sched
            .jobs
            .get(&id)
            .ok_or_else(|| Error::not_found("job", id))?;
        let queue_position = match entry.state {
            JobState::Queued => sched.queue.iter().position(|q| *q == id).map(|p| p + 1),
            _ => None,
        };

        Ok(JobStatus {
            job_id: id,
            state: entry.state.clone(),
            source: entry.spec.source.describe(),
            format: entry.spec.format,
            output: entry.spec.output.clone(),
            queue_position,
            created_at: entry.spec.created_at,
            deadline_secs: entry.spec.deadline.as_secs(),
            started_at: entry.started_at,
            finished_at: entry.finished_at,
            exit_code: entry.exit_code,
            bytes_out: entry.bytes_out,
        })
    }

    pub fn stats(&self) -> CoordinatorStats {
        let sched = self.inner.sched.lock();
        CoordinatorStats {
            running: sched.running,
            queued: sched.queue.len(),
            max_concurrent_jobs: self.inner.pool.capacity(),
            max_queue_length: self.inner.max_queue_length,
            accepting: sched.accepting,
            submitted: sched.submitted,
            succeeded: sched.succeeded,
            failed: sched.failed,
            cancelled: sched.cancelled,
            rejected: sched.rejected,
            slots: self.inner.pool.stats(),
        }
    }

    /// Whether the next submission would be rejected.
    pub fn is_saturated(&self) -> bool {
        let sched = self.inner.sched.lock();
        !sched.accepting
            || (sched.running >= self.inner.pool.capacity()
                && sched.queue.len() >= self.inner.max_queue_length)
    }

    /// Stop accepting work, cancel everything queued or running, and wait
    /// until every running job has settled.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut sched = inner.sched.lock();
            sched.accepting = false;
            while let Some(id) = sched.queue.pop_front() {
                cancel_queued(inner, &mut sched, id);
            }
            for entry in sched.jobs.values() {
                if entry.state == JobState::Running {
                    let _ = entry.reason.set(CancelReason::Shutdown);
                    entry.cancel.cancel();
                }
            }
            tracing::info!(running = sched.running, "Coordinator shutting down");
        }

        loop {
            let idle = inner.idle.notified();
            if inner.sched.lock().running == 0 {
                break;
            }
            idle.await;
        }
        tracing::info!("Coordinator stopped");
    }
}

/// Cancels its job on drop. Used to tie a job to the request that waits on
/// it, so a client disconnect stops the transcode.
pub struct CancelGuard {
    coordinator: JobCoordinator,
    id: JobId,
    armed: bool,
}

impl CancelGuard {
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed && self.coordinator.cancel(self.id).is_ok() {
            tracing::info!(job_id = %self.id, "Caller went away; job cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling internals
// ---------------------------------------------------------------------------

fn start(inner: &Arc<Inner>, sched: &mut Sched, id: JobId, slot: ResourceSlot) {
    let Some(entry) = sched.jobs.get_mut(&id) else {
        return;
    };
    if let Err(e) = entry.state.transition(JobState::Running) {
        tracing::error!(job_id = %id, "{e}");
        return;
    }
    entry.started_at = Some(Utc::now());

    let spec = entry.spec.clone();
    let cancel = entry.cancel.clone();
    let reason = entry.reason.clone();
    sched.running += 1;

    inner.events.broadcast(EventPayload::JobStarted { job_id: id });
    tracing::info!(job_id = %id, format = %spec.format, source = %spec.source.describe(), "Job started");

    tokio::spawn(drive(inner.clone(), spec, cancel, reason, slot));
}

fn cancel_queued(inner: &Inner, sched: &mut Sched, id: JobId) {
    if let Some(entry) = sched.jobs.get_mut(&id) {
        entry.settle(JobOutcome::cancelled_in_queue(id));
    }
    sched.cancelled += 1;
    sched.retire(id, inner.retained_jobs);
    inner.events.broadcast(EventPayload::JobCancelled { job_id: id });
    tracing::info!(job_id = %id, "Queued job cancelled");
}

/// Owns the slot for the lifetime of a running job. The job body runs in its
/// own task so that a panic there still reaches `finish`.
async fn drive(
    inner: Arc<Inner>,
    spec: Arc<JobSpec>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    slot: ResourceSlot,
) {
    let started = Instant::now();
    let body = tokio::spawn(execute(
        inner.runner.clone(),
        inner.store.clone(),
        spec.clone(),
        cancel,
        reason,
    ));

    let (state, result, output) = match body.await {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(job_id = %spec.id, "Job task failed: {e}");
            let reason = FailureReason::Transcode {
                exit_code: None,
                stderr_excerpt: "job task panicked".into(),
            };
            (
                JobState::Failed(reason.clone()),
                RunResult::failed(reason),
                None,
            )
        }
    };

    let outcome = JobOutcome {
        job_id: spec.id,
        state,
        exit_code: result.exit_code,
        bytes_out: result.bytes_out,
        stderr_excerpt: result.stderr_excerpt,
        output,
        run_time: started.elapsed(),
    };
    finish(&inner, outcome, slot);
}

/// Run the job under its deadline and map the runner's result onto a
/// terminal state.
async fn execute(
    runner: Arc<dyn TranscodeRunner>,
    store: Arc<dyn MediaStore>,
    spec: Arc<JobSpec>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
) -> (JobState, RunResult, Option<OutputRef>) {
    let run = run_job(runner.as_ref(), store.as_ref(), &spec, cancel.clone());
    tokio::pin!(run);

    let (result, output) = tokio::select! {
        done = &mut run => done,
        _ = tokio::time::sleep(spec.deadline) => {
            let _ = reason.set(CancelReason::Deadline);
            cancel.cancel();
            tracing::warn!(job_id = %spec.id, deadline = ?spec.deadline, "Deadline exceeded; stopping job");
            run.await
        }
    };

    let state = match (&result.outcome, reason.get()) {
        (RunOutcome::Succeeded, _) => JobState::Succeeded,
        (_, Some(CancelReason::Deadline)) => JobState::Failed(FailureReason::DeadlineExceeded),
        (_, Some(CancelReason::Caller | CancelReason::Shutdown)) => JobState::Cancelled,
        (RunOutcome::Failed(failure), None) => JobState::Failed(failure.clone()),
        (RunOutcome::Cancelled, None) => JobState::Cancelled,
    };
    (state, result, output)
}

/// Open the job's source and sink, run the transcoder, then commit or
/// discard the output.
async fn run_job(
    runner: &dyn TranscodeRunner,
    store: &dyn MediaStore,
    spec: &JobSpec,
    cancel: CancellationToken,
) -> (RunResult, Option<OutputRef>) {
    let OpenedSource { input, staged } = tokio::select! {
        opened = store.open_source(&spec.source) => match opened {
            Ok(source) => source,
            Err(e) => return (RunResult::failed(io_failure(e, RelaySide::Source)), None),
        },
        _ = cancel.cancelled() => return (RunResult::cancelled(), None),
    };
    let sink = match store.open_sink(spec.id, &spec.output).await {
        Ok(sink) => sink,
        Err(e) => return (RunResult::failed(io_failure(e, RelaySide::Sink)), None),
    };

    let mut result = runner.run(spec, input, sink.writer, cancel).await;
    drop(staged);
    if result.outcome != RunOutcome::Succeeded {
        store.discard(sink.pending).await;
        return (result, None);
    }

    match store.commit(sink.pending).await {
        Ok(output) => (result, Some(output)),
        Err(e) => {
            result.outcome = RunOutcome::Failed(io_failure(e, RelaySide::Sink));
            (result, None)
        }
    }
}

fn io_failure(err: Error, fallback: RelaySide) -> FailureReason {
    match err {
        Error::Io { side, message } => FailureReason::Io { side, message },
        other => FailureReason::Io {
            side: fallback,
            message: other.to_string(),
        },
    }
}

/// Record the outcome, release the slot and admit from the queue, all under
/// the scheduler lock.
fn finish(inner: &Arc<Inner>, outcome: JobOutcome, slot: ResourceSlot) {
    let id = outcome.job_id;
    let mut sched = inner.sched.lock();
    drop(slot);
    sched.running = sched.running.saturating_sub(1);

    let payload = match &outcome.state {
        JobState::Succeeded => {
            sched.succeeded += 1;
            EventPayload::JobSucceeded {
                job_id: id,
                bytes_out: outcome.bytes_out,
                elapsed_ms: outcome.run_time.as_millis() as u64,
            }
        }
        JobState::Failed(reason) => {
            sched.failed += 1;
            EventPayload::JobFailed {
                job_id: id,
                reason: reason.clone(),
            }
        }
        _ => {
            sched.cancelled += 1;
            EventPayload::JobCancelled { job_id: id }
        }
    };
    tracing::info!(
        job_id = %id,
        state = %outcome.state,
        exit_code = ?outcome.exit_code,
        bytes_out = outcome.bytes_out,
        elapsed_ms = outcome.run_time.as_millis() as u64,
        "Job finished"
    );

    if let Some(entry) = sched.jobs.get_mut(&id) {
        entry.settle(outcome);
    }
    sched.retire(id, inner.retained_jobs);
    inner.events.broadcast(payload);

    while let Some(&next) = sched.queue.front() {
        let Some(slot) = inner.pool.try_acquire() else {
            break;
        };
        sched.queue.pop_front();
        start(inner, &mut sched, next, slot);
    }

    if sched.running == 0 {
        inner.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tc_av::{BoxWriter, MediaInput};
    use tc_core::config::StorageConfig;
    use tc_core::{Codec, Container, QualityTier, SourceLocator};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::store::LocalMediaStore;

    /// Runner whose behaviour is picked by the first word of the inline
    /// payload: `echo`, `hang`, `fail`, `panic` or `work`.
    #[derive(Default)]
    struct ScriptedRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscodeRunner for ScriptedRunner {
        async fn run(
            &self,
            _spec: &JobSpec,
            input: MediaInput,
            mut output: BoxWriter,
            cancel: CancellationToken,
        ) -> RunResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let mut payload = Vec::new();
            if let Ok(mut input) = input.into_reader().await {
                let _ = input.read_to_end(&mut payload).await;
            }
            let word = payload.split(|b| *b == b' ').next().unwrap_or_default().to_vec();

            let result = match word.as_slice() {
                b"echo" | b"work" => {
                    if word == b"work" {
                        tokio::time::sleep(Duration::from_millis(20)).await;
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
                b"hang" => {
                    cancel.cancelled().await;
                    RunResult::cancelled()
                }
                b"fail" => RunResult {
                    outcome: RunOutcome::Failed(FailureReason::Transcode {
                        exit_code: Some(1),
                        stderr_excerpt: "Invalid data found when processing input".into(),
                    }),
                    exit_code: Some(1),
                    bytes_out: 0,
                    stderr_excerpt: "Invalid data found when processing input".into(),
                    elapsed: Duration::ZERO,
                },
                b"panic" => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    panic!("runner exploded");
                }
                other => panic!("unknown script {:?}", String::from_utf8_lossy(other)),
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Harness {
        coordinator: JobCoordinator,
        runner: Arc<ScriptedRunner>,
        pool: SlotPool,
        dir: tempfile::TempDir,
    }

    fn harness(max_concurrent_jobs: usize, max_queue_length: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(&StorageConfig {
            spool_dir: Some(dir.path().join("spool")),
            output_dir: dir.path().join("out"),
        })
        .unwrap();
        let jobs = JobsConfig {
            max_concurrent_jobs,
            max_queue_length,
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default());
        let pool = SlotPool::new(max_concurrent_jobs);
        let coordinator = JobCoordinator::new(
            runner.clone(),
            Arc::new(store),
            pool.clone(),
            &jobs,
            Arc::new(EventBus::default()),
        );
        Harness {
            coordinator,
            runner,
            pool,
            dir,
        }
    }

    fn job(script: &str) -> JobSpec {
        JobSpec::new(
            SourceLocator::Inline(Bytes::from(script.to_string())),
            FormatParams::new(Container::Mp4, Codec::H264, QualityTier::Medium),
        )
    }

    async fn wait(handle: &JobHandle) -> JobOutcome {
        tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("job did not settle")
            .unwrap()
    }

    #[tokio::test]
    async fn job_succeeds_and_releases_its_slot() {
        let h = harness(2, 4);
        let handle = h.coordinator.submit(job("echo hello")).unwrap();
        let outcome = wait(&handle).await;

        assert_eq!(outcome.state, JobState::Succeeded);
        assert_eq!(outcome.bytes_out, 10);
        let output = outcome.output.expect("succeeded job has output");
        assert_eq!(std::fs::read(output.path()).unwrap(), b"echo hello");

        let stats = h.pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.acquired_total, 1);
        assert_eq!(stats.released_total, 1);
        assert_eq!(h.coordinator.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn staged_remote_source_is_removed_after_the_run() {
        let h = harness(1, 0);
        let source = h.dir.path().join("upload.mov");
        std::fs::write(&source, b"echo from a file").unwrap();
        let uri = reqwest::Url::from_file_path(&source).unwrap().to_string();

        let handle = h
            .coordinator
            .submit(JobSpec::new(
                SourceLocator::Remote(uri),
                FormatParams::new(Container::Mp4, Codec::H264, QualityTier::Medium),
            ))
            .unwrap();
        let outcome = wait(&handle).await;
        assert_eq!(outcome.state, JobState::Succeeded);

        let output = outcome.output.expect("succeeded job has output");
        assert_eq!(std::fs::read(output.path()).unwrap(), b"echo from a file");
        // Only the spooled output is left; the staged copy is gone.
        let spooled: Vec<_> = std::fs::read_dir(h.dir.path().join("spool"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(spooled, vec![output.path().to_path_buf()]);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn submissions_beyond_capacity_and_queue_are_overloaded() {
        let h = harness(1, 1);
        let running = h.coordinator.submit(job("hang")).unwrap();
        let queued = h.coordinator.submit(job("hang")).unwrap();

        let err = h.coordinator.submit(job("echo")).unwrap_err();
        assert!(matches!(err, Error::Overloaded { running: 1, queued: 1 }));
        assert!(h.coordinator.is_saturated());

        let stats = h.coordinator.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.slots.acquired_total, 1);
        assert_eq!(
            h.coordinator.status(queued.id()).unwrap().queue_position,
            Some(1)
        );

        h.coordinator.cancel(running.id()).unwrap();
        h.coordinator.cancel(queued.id()).unwrap();
        wait(&running).await;
        wait(&queued).await;
    }

    #[tokio::test]
    async fn zero_length_queue_rejects_the_extra_job_immediately() {
        let h = harness(2, 0);
        let a = h.coordinator.submit(job("hang")).unwrap();
        let b = h.coordinator.submit(job("hang")).unwrap();

        let started = Instant::now();
        let err = h.coordinator.submit(job("hang")).unwrap_err();
        assert!(matches!(err, Error::Overloaded { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(h.pool.in_use(), 2);

        h.coordinator.shutdown().await;
        assert_eq!(wait(&a).await.state, JobState::Cancelled);
        assert_eq!(wait(&b).await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_never_takes_a_slot() {
        let h = harness(1, 2);
        let running = h.coordinator.submit(job("hang")).unwrap();
        let queued = h.coordinator.submit(job("echo")).unwrap();

        h.coordinator.cancel(queued.id()).unwrap();
        let outcome = wait(&queued).await;
        assert_eq!(outcome.state, JobState::Cancelled);
        assert_eq!(outcome.run_time, Duration::ZERO);
        assert_eq!(h.pool.stats().acquired_total, 1);

        h.coordinator.cancel(running.id()).unwrap();
        assert_eq!(wait(&running).await.state, JobState::Cancelled);
        assert_eq!(h.pool.stats().acquired_total, 1);
        assert_eq!(h.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn cancelling_a_running_job_frees_the_slot_for_the_queue() {
        let h = harness(1, 1);
        let running = h.coordinator.submit(job("hang")).unwrap();
        let next = h.coordinator.submit(job("echo next")).unwrap();

        h.coordinator.cancel(running.id()).unwrap();
        assert_eq!(wait(&running).await.state, JobState::Cancelled);
        assert_eq!(wait(&next).await.state, JobState::Succeeded);
        assert_eq!(h.pool.in_use(), 0);
        assert_eq!(h.pool.stats().released_total, 2);
    }

    #[tokio::test]
    async fn deadline_fails_a_job_that_never_finishes() {
        let h = harness(1, 0);
        let deadline = Duration::from_millis(200);
        let handle = h
            .coordinator
            .submit(job("hang").with_deadline(deadline))
            .unwrap();

        let outcome = wait(&handle).await;
        assert_eq!(
            outcome.state,
            JobState::Failed(FailureReason::DeadlineExceeded)
        );
        assert!(outcome.run_time >= deadline);
        assert!(outcome.run_time < deadline + Duration::from_secs(2));
        assert_eq!(h.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn caller_cancel_before_deadline_stays_cancelled() {
        let h = harness(1, 0);
        let handle = h
            .coordinator
            .submit(job("hang").with_deadline(Duration::from_secs(30)))
            .unwrap();
        h.coordinator.cancel(handle.id()).unwrap();
        assert_eq!(wait(&handle).await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_siblings() {
        let h = harness(2, 2);
        let bad = h.coordinator.submit(job("fail")).unwrap();
        let good = h.coordinator.submit(job("echo fine")).unwrap();

        let bad = wait(&bad).await;
        match &bad.state {
            JobState::Failed(FailureReason::Transcode { exit_code, stderr_excerpt }) => {
                assert_eq!(*exit_code, Some(1));
                assert!(stderr_excerpt.contains("Invalid data"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(bad.output.is_none());
        assert_eq!(wait(&good).await.state, JobState::Succeeded);

        let stats = h.coordinator.stats();
        assert_eq!((stats.failed, stats.succeeded), (1, 1));
    }

    #[tokio::test]
    async fn runner_panic_is_a_failure_and_releases_the_slot() {
        let h = harness(1, 1);
        let boom = h.coordinator.submit(job("panic")).unwrap();
        let after = h.coordinator.submit(job("echo after")).unwrap();

        assert!(matches!(
            wait(&boom).await.state,
            JobState::Failed(FailureReason::Transcode { exit_code: None, .. })
        ));
        assert_eq!(wait(&after).await.state, JobState::Succeeded);
        assert_eq!(h.pool.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_never_exceeds_capacity_and_releases_every_slot() {
        let h = harness(3, 32);
        let mut handles = Vec::new();
        for i in 0..24 {
            let script = match i % 4 {
                0 => "fail",
                1 => "echo burst",
                _ => "work burst",
            };
            handles.push(h.coordinator.submit(job(script)).unwrap());
        }
        for handle in &handles {
            assert!(wait(handle).await.state.is_terminal());
        }

        assert!(h.runner.peak() <= 3, "peak was {}", h.runner.peak());
        let slots = h.pool.stats();
        assert_eq!(slots.in_use, 0);
        assert_eq!(slots.acquired_total, 24);
        assert_eq!(slots.released_total, 24);

        let stats = h.coordinator.stats();
        assert_eq!(stats.failed, 6);
        assert_eq!(stats.succeeded, 18);
        assert_eq!((stats.running, stats.queued), (0, 0));
    }

    #[tokio::test]
    async fn queue_is_served_in_submission_order() {
        let h = harness(1, 4);
        let mut events = h.coordinator.events().subscribe();
        let first = h.coordinator.submit(job("hang")).unwrap();
        let second = h.coordinator.submit(job("echo 2")).unwrap();
        let third = h.coordinator.submit(job("echo 3")).unwrap();

        h.coordinator.cancel(first.id()).unwrap();
        wait(&third).await;

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventPayload::JobStarted { job_id } = event.payload {
                started.push(job_id);
            }
        }
        assert_eq!(started, vec![first.id(), second.id(), third.id()]);
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let h = harness(1, 1);
        let spec = job("hang");
        let id = spec.id;
        let handle = h.coordinator.submit(spec).unwrap();

        let err = h.coordinator.submit(job("echo").with_id(id)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        h.coordinator.cancel(handle.id()).unwrap();
        wait(&handle).await;
    }

    #[tokio::test]
    async fn cancel_of_unknown_or_finished_job_is_an_error() {
        let h = harness(1, 1);
        assert!(matches!(
            h.coordinator.cancel(JobId::new()),
            Err(Error::NotFound { .. })
        ));

        let handle = h.coordinator.submit(job("echo done")).unwrap();
        wait(&handle).await;
        assert!(matches!(
            h.coordinator.cancel(handle.id()),
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_lifecycle() {
        let h = harness(1, 1);
        let handle = h.coordinator.submit(job("echo status")).unwrap();
        wait(&handle).await;

        let status = h.coordinator.status(handle.id()).unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.bytes_out, 11);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["format"]["container"], "mp4");
        assert!(json.get("queue_position").is_none());
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_beyond_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(&StorageConfig {
            spool_dir: Some(dir.path().to_path_buf()),
            output_dir: dir.path().join("out"),
        })
        .unwrap();
        let jobs = JobsConfig {
            max_concurrent_jobs: 1,
            max_queue_length: 4,
            retained_jobs: 2,
            ..Default::default()
        };
        let coordinator = JobCoordinator::new(
            Arc::new(ScriptedRunner::default()),
            Arc::new(store),
            SlotPool::new(1),
            &jobs,
            Arc::new(EventBus::default()),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let handle = coordinator.submit(job("echo x")).unwrap();
            wait(&handle).await;
            ids.push(handle.id());
        }
        assert!(matches!(
            coordinator.status(ids[0]),
            Err(Error::NotFound { .. })
        ));
        assert!(coordinator.status(ids[2]).is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_and_stops_intake() {
        let h = harness(1, 2);
        let running = h.coordinator.submit(job("hang")).unwrap();
        let queued = h.coordinator.submit(job("hang")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.coordinator.shutdown())
            .await
            .expect("shutdown hung");

        assert_eq!(wait(&running).await.state, JobState::Cancelled);
        assert_eq!(wait(&queued).await.state, JobState::Cancelled);
        assert!(matches!(
            h.coordinator.submit(job("echo")),
            Err(Error::Overloaded { .. })
        ));
        assert!(h.coordinator.is_saturated());
        assert_eq!(h.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn dropping_an_armed_guard_cancels_the_job() {
        let h = harness(1, 0);
        let handle = h.coordinator.submit(job("hang")).unwrap();
        drop(h.coordinator.guard(handle.id()));
        assert_eq!(wait(&handle).await.state, JobState::Cancelled);

        let handle = h.coordinator.submit(job("echo kept")).unwrap();
        let mut guard = h.coordinator.guard(handle.id());
        guard.disarm();
        drop(guard);
        assert_eq!(wait(&handle).await.state, JobState::Succeeded);
    }
}
