//! Single-flight gate around [`UpdateJob`] runs.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::{JobStatus, JobStep, RepopulateOutcome, RunId, StartAck, UpdateJob};
use crate::scanner::RunMode;

/// Hard wall-clock limit for one run.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default)]
struct JobState {
    run_id: RunId,
    in_flight: bool,
    /// A timed-out run whose blocking stage has not returned yet.
    draining: bool,
    step: JobStep,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
    last_success: Option<Instant>,
    last_error: Option<String>,
}

/// How a run ended.
enum RunEnd {
    Success,
    /// A stage returned an error; the step stays where it failed.
    Failed(String),
    Panicked(String),
    TimedOut,
}

/// Owns the run state. Clones share the same state, so a handler can hold
/// one while spawned runs hold others.
#[derive(Clone)]
pub struct UpdateScheduler {
    job: Arc<dyn UpdateJob>,
    cooldown: Duration,
    timeout: Duration,
    state: Arc<Mutex<JobState>>,
}

impl UpdateScheduler {
    /// `cooldown` is the default; the job may override it per request.
    pub fn new(job: Arc<dyn UpdateJob>, cooldown: Duration) -> Self {
        Self {
            job,
            cooldown,
            timeout: RUN_TIMEOUT,
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start an incremental run in the background and return immediately.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> StartAck {
        match self.try_begin() {
            Err(rejected) => rejected,
            Ok(ack) => {
                if let Some(run_id) = ack.run_id {
                    tokio::spawn(self.clone().execute(run_id, RunMode::Incremental));
                }
                ack
            }
        }
    }

    /// Wipe and rebuild the catalog, waiting for the run to finish. Shares
    /// the gate, cooldown and timeout with [`start`](Self::start).
    pub async fn repopulate(&self) -> RepopulateOutcome {
        match self.try_begin() {
            Err(rejected) => RepopulateOutcome::Rejected(rejected),
            Ok(ack) => {
                if let Some(run_id) = ack.run_id {
                    self.clone().execute(run_id, RunMode::Populate).await;
                }
                RepopulateOutcome::Finished(self.status())
            }
        }
    }

    pub fn status(&self) -> JobStatus {
        let state = self.lock();

        let duration_ms = match (state.started, state.finished) {
            (Some(started), Some(finished)) => {
                Some(finished.saturating_duration_since(started).as_millis() as u64)
            }
            _ => None,
        };
        let message = match (&state.last_error, state.in_flight) {
            (Some(err), _) => err.clone(),
            (None, true) => "running".to_string(),
            (None, false) => "idle".to_string(),
        };

        JobStatus {
            run_id: state.run_id,
            updated: !state.in_flight && state.started_at.is_some() && state.last_error.is_none(),
            in_progress: state.in_flight,
            started_at: state.started_at,
            step: state.step,
            duration_ms,
            message,
            last_error: state.last_error.clone(),
        }
    }

    /// Apply the in-flight and cooldown gate. On acceptance the state is
    /// reset for a new run id and the accepted ack is returned.
    fn try_begin(&self) -> Result<StartAck, StartAck> {
        let cooldown = self.job.cooldown(self.cooldown);
        let mut state = self.lock();

        if state.in_flight || state.draining {
            let message = if state.in_flight {
                "update already in progress"
            } else {
                "timed-out update still stopping"
            };
            return Err(StartAck {
                accepted: false,
                in_progress: true,
                run_id: None,
                cooldown_secs: None,
                step: state.step,
                message: message.to_string(),
                started_at: state.started_at,
            });
        }

        if let Some(last) = state.last_success {
            let since = last.elapsed();
            if since < cooldown {
                let remaining = ((cooldown - since).as_secs_f64() + 0.5) as u64;
                return Err(StartAck {
                    accepted: false,
                    in_progress: false,
                    run_id: None,
                    cooldown_secs: Some(remaining),
                    step: state.step,
                    message: format!("update on cooldown, retry in {}s", remaining),
                    started_at: state.started_at,
                });
            }
        }

        state.run_id = state.run_id.next();
        state.in_flight = true;
        state.step = JobStep::Queued;
        state.started_at = Some(Utc::now());
        state.started = Some(Instant::now());
        state.finished = None;
        state.last_error = None;

        Ok(StartAck {
            accepted: true,
            in_progress: true,
            run_id: Some(state.run_id),
            cooldown_secs: None,
            step: state.step,
            message: "update started".to_string(),
            started_at: state.started_at,
        })
    }

    async fn execute(self, run_id: RunId, mode: RunMode) {
        info!("Run {} started (mode {})", run_id.0, mode.as_str());
        let cancel = Arc::new(AtomicBool::new(false));

        let mut stages = tokio::spawn(self.clone().run_stages(run_id, mode, cancel.clone()));

        let end = match tokio::time::timeout(self.timeout, &mut stages).await {
            Ok(Ok(Ok(()))) => RunEnd::Success,
            Ok(Ok(Err(message))) => RunEnd::Failed(message),
            Ok(Err(join_err)) if join_err.is_panic() => {
                RunEnd::Panicked(panic_message(join_err.into_panic()))
            }
            Ok(Err(join_err)) => RunEnd::Failed(format!("run aborted: {}", join_err)),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                RunEnd::TimedOut
            }
        };

        let timed_out = matches!(end, RunEnd::TimedOut);
        self.finish(run_id, end);

        // A blocking stage cannot be aborted. Keep the gate closed until it
        // returns so no other run touches the catalog meanwhile.
        if timed_out {
            let scheduler = self.clone();
            tokio::spawn(async move {
                match stages.await {
                    Ok(result) => info!("Timed-out run {} stopped: {:?}", run_id.0, result),
                    Err(e) => warn!("Timed-out run {} ended abnormally: {}", run_id.0, e),
                }
                scheduler.end_drain(run_id);
            });
        }
    }

    async fn run_stages(self, run_id: RunId, mode: RunMode, cancel: Arc<AtomicBool>) -> Result<(), String> {
        self.set_step(run_id, JobStep::DbUpdate);
        let job = self.job.clone();
        let flag = cancel.clone();
        let summary = join_blocking(tokio::task::spawn_blocking(move || job.reconcile(mode, &flag)))
            .await
            .map_err(|e| format!("db-update failed: {}", e))?;
        info!(
            "Run {}: {} passes processed, {} images inserted",
            run_id.0, summary.processed, summary.images_inserted
        );

        if cancel.load(Ordering::Relaxed) {
            return Err("run cancelled before thumbgen".to_string());
        }

        self.set_step(run_id, JobStep::Thumbgen);
        let job = self.job.clone();
        let flag = cancel.clone();
        let thumbs = join_blocking(tokio::task::spawn_blocking(move || job.generate_thumbnails(&flag)))
            .await
            .map_err(|e| format!("thumbgen failed: {}", e))?;
        info!("Run {}: {} thumbnails generated", run_id.0, thumbs.generated);

        Ok(())
    }

    /// Writes from a superseded or already finished run are dropped.
    fn set_step(&self, run_id: RunId, step: JobStep) {
        let mut state = self.lock();
        if state.run_id == run_id && state.in_flight {
            state.step = step;
        }
    }

    fn end_drain(&self, run_id: RunId) {
        let mut state = self.lock();
        if state.run_id == run_id {
            state.draining = false;
        }
    }

    fn finish(&self, run_id: RunId, end: RunEnd) {
        let mut state = self.lock();
        if state.run_id != run_id {
            warn!("Ignoring result of stale run {}", run_id.0);
            return;
        }

        let now = Instant::now();
        state.in_flight = false;
        state.finished = Some(now);

        match end {
            RunEnd::Success => {
                state.step = JobStep::Done;
                state.last_success = Some(now);
                state.last_error = None;
                info!("Run {} finished", run_id.0);
            }
            RunEnd::Failed(message) => {
                error!("Run {} failed at {}: {}", run_id.0, state.step, message);
                state.last_error = Some(message);
            }
            RunEnd::Panicked(message) => {
                error!("Run {} panicked: {}", run_id.0, message);
                state.step = JobStep::Panic;
                state.last_error = Some(format!("panic: {}", message));
            }
            RunEnd::TimedOut => {
                let message = format!("update timed out after {}s", self.timeout.as_secs());
                error!("Run {} at {}: {}", run_id.0, state.step, message);
                state.step = JobStep::Timeout;
                state.draining = true;
                state.last_error = Some(message);
            }
        }
    }
}

/// Await a blocking stage, re-raising its panic in the calling task.
async fn join_blocking<T>(handle: tokio::task::JoinHandle<T>) -> T {
    match handle.await {
        Ok(value) => value,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        // Only reachable while the runtime shuts down.
        Err(e) => std::panic::resume_unwind(Box::new(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IngestError, Result};
    use crate::scanner::{ScanSummary, ThumbnailSummary};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        FailThumbnails,
        Panic,
        HangUntilCancelled,
    }

    struct FakeJob {
        behavior: Behavior,
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        modes: Mutex<Vec<RunMode>>,
    }

    impl FakeJob {
        fn new(behavior: Behavior, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                delay,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
            })
        }
    }

    impl UpdateJob for FakeJob {
        fn reconcile(&self, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().unwrap().push(mode);
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Panic => panic!("boom"),
                Behavior::HangUntilCancelled => loop {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(IngestError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                },
                _ => Ok(ScanSummary::default()),
            }
        }

        fn generate_thumbnails(&self, _cancel: &AtomicBool) -> Result<ThumbnailSummary> {
            match self.behavior {
                Behavior::FailThumbnails => Err(IngestError::Config("disk full".to_string())),
                _ => Ok(ThumbnailSummary::default()),
            }
        }
    }

    async fn wait_idle(scheduler: &UpdateScheduler) -> JobStatus {
        for _ in 0..500 {
            let status = scheduler.status();
            if !status.in_progress {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run did not finish");
    }

    #[tokio::test]
    async fn test_single_flight_gate() {
        let job = FakeJob::new(Behavior::Succeed, Duration::from_millis(100));
        let scheduler = UpdateScheduler::new(job.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(async { scheduler.start() }, async { scheduler.start() });
        let accepted = [&a, &b].iter().filter(|ack| ack.accepted).count();
        assert_eq!(accepted, 1);
        let rejected = if a.accepted { &b } else { &a };
        assert!(rejected.in_progress);
        assert_eq!(rejected.message, "update already in progress");
        assert_eq!(rejected.cooldown_secs, None);

        let status = wait_idle(&scheduler).await;
        assert!(status.updated);
        assert_eq!(status.step, JobStep::Done);
        assert!(status.duration_ms.is_some());
        assert_eq!(status.run_id, RunId(1));
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*job.modes.lock().unwrap(), vec![RunMode::Incremental]);
    }

    #[tokio::test]
    async fn test_cooldown_after_success() {
        let job = FakeJob::new(Behavior::Succeed, Duration::ZERO);
        let scheduler = UpdateScheduler::new(job, Duration::from_secs(60));

        assert!(scheduler.start().accepted);
        wait_idle(&scheduler).await;

        let ack = scheduler.start();
        assert!(!ack.accepted);
        assert!(!ack.in_progress);
        assert_eq!(ack.cooldown_secs, Some(60));
        assert_eq!(ack.step, JobStep::Done);
    }

    #[tokio::test]
    async fn test_failed_run_has_no_cooldown() {
        let job = FakeJob::new(Behavior::FailThumbnails, Duration::ZERO);
        let scheduler = UpdateScheduler::new(job, Duration::from_secs(60));

        assert!(scheduler.start().accepted);
        let status = wait_idle(&scheduler).await;
        assert!(!status.updated);
        assert_eq!(status.step, JobStep::Thumbgen);
        assert_eq!(status.message, "thumbgen failed: config error: disk full");

        let ack = scheduler.start();
        assert!(ack.accepted);
        assert_eq!(ack.run_id, Some(RunId(2)));
        wait_idle(&scheduler).await;
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let job = FakeJob::new(Behavior::Panic, Duration::ZERO);
        let scheduler = UpdateScheduler::new(job, Duration::from_secs(60));

        assert!(scheduler.start().accepted);
        let status = wait_idle(&scheduler).await;
        assert_eq!(status.step, JobStep::Panic);
        assert_eq!(status.last_error.as_deref(), Some("panic: boom"));
        assert!(!status.updated);

        // Not wedged: the next start is accepted.
        assert!(scheduler.start().accepted);
        wait_idle(&scheduler).await;
    }

    #[tokio::test]
    async fn test_timeout_cancels_run() {
        let job = FakeJob::new(Behavior::HangUntilCancelled, Duration::ZERO);
        let scheduler = UpdateScheduler::new(job, Duration::from_secs(60))
            .with_timeout(Duration::from_millis(50));

        assert!(scheduler.start().accepted);
        let status = wait_idle(&scheduler).await;
        assert_eq!(status.step, JobStep::Timeout);
        assert!(status.message.contains("timed out"));
        assert!(!status.updated);
    }

    #[tokio::test]
    async fn test_timed_out_stage_blocks_next_run_until_it_returns() {
        let job = FakeJob::new(Behavior::Succeed, Duration::from_millis(300));
        let scheduler = UpdateScheduler::new(job.clone(), Duration::from_secs(60))
            .with_timeout(Duration::from_millis(50));

        assert!(scheduler.start().accepted);
        let status = wait_idle(&scheduler).await;
        assert_eq!(status.step, JobStep::Timeout);

        let ack = scheduler.start();
        assert!(!ack.accepted);
        assert!(ack.in_progress);
        assert_eq!(ack.message, "timed-out update still stopping");

        let mut accepted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if scheduler.start().accepted {
                accepted = true;
                break;
            }
        }
        assert!(accepted);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);

        wait_idle(&scheduler).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repopulate_blocks_and_shares_gate() {
        let job = FakeJob::new(Behavior::Succeed, Duration::from_millis(20));
        let scheduler = UpdateScheduler::new(job.clone(), Duration::from_secs(60));

        let outcome = scheduler.repopulate().await;
        let status = match outcome {
            RepopulateOutcome::Finished(status) => status,
            RepopulateOutcome::Rejected(ack) => panic!("rejected: {:?}", ack),
        };
        assert!(status.updated);
        assert!(!status.in_progress);
        assert_eq!(*job.modes.lock().unwrap(), vec![RunMode::Populate]);

        assert_eq!(scheduler.start().cooldown_secs, Some(60));
        assert!(matches!(
            scheduler.repopulate().await,
            RepopulateOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_run_results_are_ignored() {
        let job = FakeJob::new(Behavior::Succeed, Duration::ZERO);
        let scheduler = UpdateScheduler::new(job, Duration::from_secs(60));

        let ack = scheduler.try_begin().unwrap();
        assert_eq!(ack.run_id, Some(RunId(1)));

        scheduler.set_step(RunId(0), JobStep::Thumbgen);
        scheduler.finish(RunId(0), RunEnd::Success);

        let status = scheduler.status();
        assert!(status.in_progress);
        assert_eq!(status.step, JobStep::Queued);
        assert_eq!(status.message, "running");
    }

    #[test]
    fn test_idle_status() {
        let job = FakeJob::new(Behavior::Succeed, Duration::ZERO);
        let status = UpdateScheduler::new(job, Duration::from_secs(60)).status();
        assert!(!status.updated);
        assert!(!status.in_progress);
        assert_eq!(status.step, JobStep::Idle);
        assert_eq!(status.message, "idle");
        assert_eq!(status.duration_ms, None);
    }
}
