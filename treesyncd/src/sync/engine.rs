use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use treesync_core::StoreError;

use super::apply::ApplyOutcome;
use super::diff::DiffError;
use super::folders::PathCreationError;
use super::progress::{DEFAULT_MAX_ERRORS, JobProgress, JobProgressRecorder, JobSummary};
use super::quota::QuotaError;
use super::retry::RetryStore;
use super::source::{Source, SourceError};
use super::writer::ResourceWriter;
use super::{full, incremental};

pub const DEFAULT_CHANGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Failure applying one change. Recorded against that change and never fatal
/// on its own; the error budget decides when a run stops.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    PathCreation(#[from] PathCreationError),
    #[error("reading file {path}: {source}")]
    Read { path: String, source: SourceError },
    #[error("unsupported file {path}: {reason}")]
    Unsupported { path: String, reason: String },
    #[error("writing resource from file {path}: {source}")]
    Write { path: String, source: StoreError },
    #[error("deleting resource {group}/{kind} {name}: {source}")]
    Delete {
        group: String,
        kind: String,
        name: String,
        source: StoreError,
    },
    #[error("processing change for file {path}: missing existing reference")]
    MissingIdentity { path: String },
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("skipped: {reason}")]
    Skipped { reason: String },
}

/// Setup failure that stops a run before or outside the apply loop.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("resolve source revision: {0}")]
    Revision(SourceError),
    #[error("create root folder: {0}")]
    RootFolder(StoreError),
    #[error("list target resources: {0}")]
    ListTarget(StoreError),
    #[error("list source tree: {0}")]
    ListSource(SourceError),
    #[error("compare changes: {0}")]
    Compare(#[from] DiffError),
    #[error("compare revisions: {0}")]
    CompareRevisions(SourceError),
    #[error("read resource stats: {0}")]
    Stats(StoreError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Job identity; owns everything the run writes.
    pub job: String,
    /// Title of the root folder in the store.
    pub root_title: String,
    pub max_errors: usize,
    /// Abort when the error budget is reached instead of exceeded.
    pub strict_errors: bool,
    pub change_timeout: Duration,
    pub page_size: u32,
    /// Resource-count ceiling for the quota precheck; zero means unlimited.
    pub quota_limit: u64,
}

impl SyncOptions {
    pub fn new(job: impl Into<String>, root_title: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            root_title: root_title.into(),
            max_errors: DEFAULT_MAX_ERRORS,
            strict_errors: false,
            change_timeout: DEFAULT_CHANGE_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            quota_limit: 0,
        }
    }
}

/// How a run derives its change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Compare full listings of the source tree and the store.
    Full,
    /// Apply only the changes between `previous_rev` and the latest revision.
    /// Requires a versioned source.
    Incremental { previous_rev: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// The run finished, but some changes failed.
    PartialSuccess,
    /// The run stopped early; nothing was rolled back.
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: RunOutcome,
    /// Revision safe to persist as the new sync point; None after an abort.
    pub rev: Option<String>,
    pub summary: JobSummary,
}

/// Drives one source into the store, either from full listings or from the
/// revision diff the source reports.
pub struct SyncEngine {
    store: Arc<RetryStore>,
    source: Arc<dyn Source>,
    options: SyncOptions,
    notify: Option<watch::Sender<JobProgress>>,
}

impl SyncEngine {
    pub fn new(store: Arc<RetryStore>, source: Arc<dyn Source>, options: SyncOptions) -> Self {
        Self {
            store,
            source,
            options,
            notify: None,
        }
    }

    pub fn with_notifier(mut self, notify: watch::Sender<JobProgress>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Runs one reconciliation. Budget and cancellation aborts still produce
    /// a report; only setup failures are errors.
    pub async fn reconcile(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, ReconcileError> {
        let current_rev = self
            .source
            .latest_rev()
            .await
            .map_err(ReconcileError::Revision)?;

        let mut progress = JobProgressRecorder::new(self.options.max_errors);
        if self.options.strict_errors {
            progress.strict_max_errors();
        }
        if let Some(tx) = &self.notify {
            progress = progress.with_notifier(tx.clone());
        }
        let mut writer = ResourceWriter::new(
            self.store.clone(),
            self.source.clone(),
            self.options.job.as_str(),
            self.options.root_title.as_str(),
        );

        let outcome = match &mode {
            SyncMode::Incremental { previous_rev } => {
                info!(job = %self.options.job, previous = %previous_rev, current = %current_rev, "incremental sync");
                incremental::run(
                    &mut writer,
                    self.source.as_ref(),
                    self.store.as_ref(),
                    &self.options,
                    previous_rev,
                    &current_rev,
                    &mut progress,
                    cancel,
                )
                .await?
            }
            SyncMode::Full => {
                info!(job = %self.options.job, current = %current_rev, "full sync");
                full::run(
                    &mut writer,
                    self.store.as_ref(),
                    self.source.as_ref(),
                    &self.options,
                    &current_rev,
                    &mut progress,
                    cancel,
                )
                .await?
            }
        };

        let summary = progress.summary();
        let report = match outcome {
            ApplyOutcome::Aborted(reason) => {
                warn!(job = %self.options.job, reason = %reason, "sync aborted");
                SyncReport {
                    outcome: RunOutcome::Aborted(reason),
                    rev: None,
                    summary,
                }
            }
            ApplyOutcome::Completed if summary.error_count > 0 => SyncReport {
                outcome: RunOutcome::PartialSuccess,
                rev: Some(current_rev),
                summary,
            },
            ApplyOutcome::Completed => SyncReport {
                outcome: RunOutcome::Success,
                rev: Some(current_rev),
                summary,
            },
        };
        info!(
            job = %self.options.job,
            processed = report.summary.processed,
            errors = report.summary.error_count,
            "sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
