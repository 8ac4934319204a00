//! Single-flight scheduling of catalog runs.
//!
//! A run is two blocking stages, reconciliation then thumbnail generation,
//! executed by an [`UpdateJob`]. The [`UpdateScheduler`] makes sure at most
//! one run is in flight, enforces a cooldown after successful runs and a
//! hard timeout on every run, and exposes the current step for polling.

pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::prefs::PrefsStore;
use crate::scanner::{run_catalog_update, run_thumbnail_stage, RunMode, ScanSummary, ThumbnailSummary};

pub use scheduler::{UpdateScheduler, RUN_TIMEOUT};

/// Identifier of an accepted run. Increases by one per accepted start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next(self) -> Self {
        RunId(self.0 + 1)
    }
}

/// Where the current (or last) run is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStep {
    #[default]
    Idle,
    Queued,
    DbUpdate,
    Thumbgen,
    Done,
    Panic,
    Timeout,
}

impl JobStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::Idle => "idle",
            JobStep::Queued => "queued",
            JobStep::DbUpdate => "db-update",
            JobStep::Thumbgen => "thumbgen",
            JobStep::Done => "done",
            JobStep::Panic => "panic",
            JobStep::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for JobStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immediate answer to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartAck {
    pub accepted: bool,
    pub in_progress: bool,
    pub run_id: Option<RunId>,
    /// Seconds until the cooldown ends, when rejected for cooldown.
    pub cooldown_secs: Option<u64>,
    pub step: JobStep,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Snapshot of the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub run_id: RunId,
    /// Last run finished without error.
    pub updated: bool,
    pub in_progress: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub step: JobStep,
    pub duration_ms: Option<u64>,
    pub message: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepopulateOutcome {
    Rejected(StartAck),
    Finished(JobStatus),
}

/// The work behind a scheduled run. Both stages are blocking and should
/// return promptly once `cancel` is set.
pub trait UpdateJob: Send + Sync + 'static {
    fn reconcile(&self, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary>;

    fn generate_thumbnails(&self, cancel: &AtomicBool) -> Result<ThumbnailSummary>;

    /// Minimum time between the end of a successful run and the next start.
    fn cooldown(&self, default: Duration) -> Duration {
        default
    }
}

/// Runs against the configured preference store, catalog and live output dir.
pub struct CatalogJob {
    config: Config,
}

impl CatalogJob {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl UpdateJob for CatalogJob {
    fn reconcile(&self, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary> {
        run_catalog_update(&self.config, mode, cancel)
    }

    fn generate_thumbnails(&self, cancel: &AtomicBool) -> Result<ThumbnailSummary> {
        run_thumbnail_stage(&self.config, cancel)
    }

    /// The persisted `update_cd` setting, read on every start request. The
    /// store is opened read-only; a missing store means the default.
    fn cooldown(&self, default: Duration) -> Duration {
        let path = self.config.prefs_db_path();
        if !path.exists() {
            return default;
        }
        let read = || -> Result<Duration> {
            PrefsStore::open_read_only(&path)?.update_cooldown(default)
        };
        read().unwrap_or_else(|e| {
            warn!("Cannot read update cooldown, using default: {}", e);
            default
        })
    }
}
