use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::engine::SyncError;
use super::safepath;
use super::source::ChangeAction;

pub const DEFAULT_MAX_ERRORS: usize = 20;

const STORED_ERROR_CAP: usize = 20;
const NOTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one applied change, as fed to the recorder.
#[derive(Debug)]
pub struct JobResourceResult {
    pub path: String,
    pub name: String,
    pub group: String,
    pub kind: String,
    pub action: ChangeAction,
    pub error: Option<SyncError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub group: String,
    pub kind: String,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub renamed: u64,
    pub ignored: u64,
    pub errored: u64,
}

impl ResourceSummary {
    fn bump(&mut self, action: ChangeAction, failed: bool) {
        match action {
            ChangeAction::Created => self.created += 1,
            ChangeAction::Updated => self.updated += 1,
            ChangeAction::Deleted => self.deleted += 1,
            ChangeAction::Renamed => self.renamed += 1,
            ChangeAction::Ignored => self.ignored += 1,
        }
        if failed {
            self.errored += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub started: String,
    pub message: String,
    pub total: Option<usize>,
    pub processed: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub resources: Vec<ResourceSummary>,
}

/// Snapshot pushed through the watch notifier while a run is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub message: String,
    pub processed: usize,
    pub total: Option<usize>,
    pub errors: usize,
}

/// Collects per-change results for one reconciliation run: per group/kind
/// counters, the error budget, and the two containment sets the apply loop
/// consults before dispatching a change.
pub struct JobProgressRecorder {
    started: OffsetDateTime,
    max_errors: usize,
    strict: bool,
    error_count: usize,
    errors: Vec<String>,
    totals: HashMap<(String, String), ResourceSummary>,
    total: Option<usize>,
    processed: usize,
    message: String,
    final_message: Option<String>,
    failed_creations: HashSet<String>,
    failed_deletions: HashSet<String>,
    notify: Option<watch::Sender<JobProgress>>,
    last_notified: Option<Instant>,
}

impl JobProgressRecorder {
    pub fn new(max_errors: usize) -> Self {
        Self {
            started: OffsetDateTime::now_utc(),
            max_errors,
            strict: false,
            error_count: 0,
            errors: Vec::new(),
            totals: HashMap::new(),
            total: None,
            processed: 0,
            message: String::new(),
            final_message: None,
            failed_creations: HashSet::new(),
            failed_deletions: HashSet::new(),
            notify: None,
            last_notified: None,
        }
    }

    pub fn with_notifier(mut self, notify: watch::Sender<JobProgress>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Abort once the budget is reached rather than exceeded.
    pub fn strict_max_errors(&mut self) {
        self.strict = true;
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = Some(total);
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
        debug!(message = %self.message, "progress");
        self.send_now();
    }

    /// Message shown for the run as a whole; wins over the last interim one.
    pub fn set_final_message(&mut self, message: impl Into<String>) {
        self.final_message = Some(message.into());
    }

    pub fn record(&mut self, result: JobResourceResult) {
        self.processed += 1;
        let failed = result.error.is_some();
        if let Some(err) = &result.error {
            if let SyncError::PathCreation(path_err) = err {
                self.failed_creations.insert(path_err.path.clone());
            }
            if result.action == ChangeAction::Deleted {
                self.failed_deletions.insert(safepath::parent(&result.path));
            }
            warn!(path = %result.path, action = ?result.action, error = %err, "change failed");
            if self.errors.len() < STORED_ERROR_CAP {
                self.errors.push(err.to_string());
            }
            // Ignored results carry skip explanations, not real failures.
            if result.action != ChangeAction::Ignored {
                self.error_count += 1;
            }
        } else {
            debug!(path = %result.path, action = ?result.action, "change applied");
        }
        self.totals
            .entry((result.group.clone(), result.kind.clone()))
            .or_insert_with(|| ResourceSummary {
                group: result.group.clone(),
                kind: result.kind.clone(),
                ..ResourceSummary::default()
            })
            .bump(result.action, failed);
        self.maybe_notify();
    }

    /// The abort reason once the error budget is exhausted.
    pub fn too_many_errors(&self) -> Option<String> {
        if self.max_errors == 0 {
            return None;
        }
        let exhausted = if self.strict {
            self.error_count >= self.max_errors
        } else {
            self.error_count > self.max_errors
        };
        exhausted.then(|| format!("too many errors: {}", self.error_count))
    }

    /// True when a failed folder creation sits above `path`, so applying the
    /// change could only fail the same way.
    pub fn is_nested_under_failed_creation(&self, path: &str) -> bool {
        self.failed_creations
            .iter()
            .any(|dir| safepath::in_dir(path, dir))
    }

    /// True when a recorded deletion failure sits at or below `dir`; deleting
    /// the directory would orphan what could not be removed.
    pub fn has_failed_deletions_under(&self, dir: &str) -> bool {
        self.failed_deletions
            .iter()
            .any(|p| p == dir || safepath::in_dir(p, dir))
    }

    pub fn summary(&self) -> JobSummary {
        let mut resources: Vec<ResourceSummary> = self.totals.values().cloned().collect();
        resources.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
        JobSummary {
            started: self.started.format(&Rfc3339).unwrap_or_default(),
            message: self
                .final_message
                .clone()
                .unwrap_or_else(|| self.message.clone()),
            total: self.total,
            processed: self.processed,
            error_count: self.error_count,
            errors: self.errors.clone(),
            resources,
        }
    }

    fn progress(&self) -> JobProgress {
        JobProgress {
            message: self.message.clone(),
            processed: self.processed,
            total: self.total,
            errors: self.error_count,
        }
    }

    fn send_now(&mut self) {
        if let Some(tx) = &self.notify {
            self.last_notified = Some(Instant::now());
            let _ = tx.send(self.progress());
        }
    }

    fn maybe_notify(&mut self) {
        if self.notify.is_none() {
            return;
        }
        if let Some(last) = self.last_notified
            && last.elapsed() < NOTIFY_INTERVAL
        {
            return;
        }
        self.send_now();
    }
}
