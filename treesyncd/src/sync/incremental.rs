use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::info;
use treesync_core::{FOLDER_GROUP, FOLDER_KIND};

use super::apply::{self, ApplyOutcome};
use super::diff::{ResourceFileChange, nearest_supported_dir};
use super::engine::{ReconcileError, SyncError, SyncOptions};
use super::progress::{JobProgressRecorder, JobResourceResult};
use super::quota;
use super::retry::RetryStore;
use super::safepath;
use super::source::{ChangeAction, Source, VersionedChange};
use super::writer::{ResourceWriter, is_path_supported};

/// Incremental reconciliation: asks the source for the changes between the
/// last synced revision and the current one and applies only those. The store
/// is never listed; identities for deletions come from reading files at the
/// revision they last existed in.
pub(crate) async fn run(
    writer: &mut ResourceWriter,
    source: &dyn Source,
    store: &RetryStore,
    options: &SyncOptions,
    previous_rev: &str,
    current_rev: &str,
    progress: &mut JobProgressRecorder,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome, ReconcileError> {
    if previous_rev == current_rev {
        progress.set_final_message("same revision as last sync");
        return Ok(ApplyOutcome::Completed);
    }

    progress.set_message("comparing revisions");
    let diffs = source
        .compare_revisions(previous_rev, current_rev)
        .await
        .map_err(ReconcileError::CompareRevisions)?;
    if diffs.is_empty() {
        progress.set_final_message("no changes to sync");
        return Ok(ApplyOutcome::Completed);
    }

    let mut plan = Plan::default();
    for entry in diffs {
        plan.push(entry, previous_rev, current_rev);
    }
    let Plan {
        mut changes,
        cleanup,
        ..
    } = plan;
    changes.sort_by(|a, b| safepath::depth_cmp(&a.path, &b.path, false));

    let stats = store.get_stats().await.map_err(ReconcileError::Stats)?;
    quota::check_quota(net_content_change(&changes), &stats, options.quota_limit)?;

    info!(job = %options.job, changes = changes.len(), "applying changes");
    progress.set_total(changes.len());
    progress.set_message("applying changes");
    let outcome =
        apply::apply_changes(writer, changes, progress, cancel, options.change_timeout).await;
    if matches!(outcome, ApplyOutcome::Aborted(_)) {
        return Ok(outcome);
    }

    cleanup_directories(writer, source, current_rev, cleanup, progress, cancel).await
}

/// The converted change list plus bookkeeping: directories already pinned by
/// a synthesized folder change and directories that may have been emptied.
#[derive(Default)]
struct Plan {
    changes: Vec<ResourceFileChange>,
    pinned: HashSet<String>,
    cleanup: Vec<String>,
}

impl Plan {
    fn push(&mut self, entry: VersionedChange, previous_rev: &str, current_rev: &str) {
        if safepath::is_dir(&entry.path) {
            match entry.action {
                ChangeAction::Created | ChangeAction::Updated => self.pin_folder(&entry.path, current_rev),
                ChangeAction::Deleted => self.cleanup.push(entry.path),
                _ => {}
            }
            return;
        }

        let supported = is_path_supported(&entry.path);
        match entry.action {
            ChangeAction::Created | ChangeAction::Updated if supported => {
                self.changes.push(ResourceFileChange {
                    path: entry.path,
                    action: entry.action,
                    existing: None,
                    previous_path: None,
                    rev: Some(current_rev.to_string()),
                    previous_rev: None,
                });
            }
            ChangeAction::Deleted if supported => {
                self.push_ancestors(&entry.path);
                self.changes.push(ResourceFileChange {
                    path: entry.path,
                    action: ChangeAction::Deleted,
                    existing: None,
                    previous_path: None,
                    rev: None,
                    previous_rev: Some(previous_rev.to_string()),
                });
            }
            ChangeAction::Renamed => {
                let previous_supported = entry
                    .previous_path
                    .as_deref()
                    .is_some_and(is_path_supported);
                match (previous_supported, supported) {
                    (true, true) => {
                        // The move may have emptied the old directory.
                        if let Some(previous_path) = entry.previous_path.as_deref() {
                            self.push_ancestors(previous_path);
                        }
                        self.changes.push(ResourceFileChange {
                            path: entry.path,
                            action: ChangeAction::Renamed,
                            existing: None,
                            previous_path: entry.previous_path,
                            rev: Some(current_rev.to_string()),
                            previous_rev: Some(previous_rev.to_string()),
                        });
                    }
                    // The object only exists on one side of the move.
                    (false, true) => self.changes.push(ResourceFileChange {
                        path: entry.path,
                        action: ChangeAction::Created,
                        existing: None,
                        previous_path: None,
                        rev: Some(current_rev.to_string()),
                        previous_rev: None,
                    }),
                    (true, false) => {
                        if let Some(previous_path) = entry.previous_path {
                            self.push_ancestors(&previous_path);
                            self.changes.push(ResourceFileChange {
                                path: previous_path,
                                action: ChangeAction::Deleted,
                                existing: None,
                                previous_path: None,
                                rev: None,
                                previous_rev: Some(previous_rev.to_string()),
                            });
                        }
                        self.pin_nearest_dir(&entry.path, current_rev);
                    }
                    (false, false) => self.pin_nearest_dir(&entry.path, current_rev),
                }
            }
            // Unsupported content still pins its nearest visible directory.
            ChangeAction::Created | ChangeAction::Updated => {
                self.pin_nearest_dir(&entry.path, current_rev)
            }
            ChangeAction::Deleted | ChangeAction::Ignored => {}
        }
    }

    fn pin_nearest_dir(&mut self, path: &str, current_rev: &str) {
        if let Some(dir) = nearest_supported_dir(path) {
            self.pin_folder(&dir, current_rev);
        }
    }

    fn pin_folder(&mut self, dir: &str, current_rev: &str) {
        if safepath::validate(dir).is_err() || !self.pinned.insert(dir.to_string()) {
            return;
        }
        self.changes.push(ResourceFileChange {
            path: dir.to_string(),
            action: ChangeAction::Created,
            existing: None,
            previous_path: None,
            rev: Some(current_rev.to_string()),
            previous_rev: None,
        });
    }

    fn push_ancestors(&mut self, path: &str) {
        let mut dir = safepath::parent(path);
        while !dir.is_empty() {
            self.cleanup.push(dir.clone());
            dir = safepath::parent(&dir);
        }
    }
}

fn net_content_change(changes: &[ResourceFileChange]) -> i64 {
    let mut net = 0i64;
    for change in changes {
        if safepath::is_dir(&change.path) {
            continue;
        }
        match change.action {
            ChangeAction::Created => net += 1,
            ChangeAction::Deleted => net -= 1,
            _ => {}
        }
    }
    net
}

/// Removes directories the run may have emptied, deepest first. A directory
/// survives when the current tree still contains it or when anything under it
/// failed to delete.
async fn cleanup_directories(
    writer: &mut ResourceWriter,
    source: &dyn Source,
    current_rev: &str,
    mut candidates: Vec<String>,
    progress: &mut JobProgressRecorder,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome, ReconcileError> {
    candidates.sort();
    candidates.dedup();
    if candidates.is_empty() {
        return Ok(ApplyOutcome::Completed);
    }

    let tree = source
        .list_tree(Some(current_rev))
        .await
        .map_err(ReconcileError::ListSource)?;
    let mut live = safepath::Trie::new();
    for entry in &tree {
        if live.add(&entry.path).is_err() {
            // Hidden or otherwise invalid content still keeps its nearest
            // visible directory alive.
            if let Some(dir) = nearest_supported_dir(&entry.path) {
                live.add(&dir).ok();
            }
        }
    }

    safepath::sort_by_depth(&mut candidates, false);
    for dir in candidates {
        if cancel.is_cancelled() {
            return Ok(ApplyOutcome::Aborted("cancelled".to_string()));
        }
        if let Some(reason) = progress.too_many_errors() {
            return Ok(ApplyOutcome::Aborted(reason));
        }
        if live.exists(&dir) {
            continue;
        }
        if progress.has_failed_deletions_under(&dir) {
            progress.record(folder_result(
                &dir,
                String::new(),
                ChangeAction::Ignored,
                Some(SyncError::Skipped {
                    reason: "folder still contains resources that failed deletion".to_string(),
                }),
            ));
            continue;
        }
        match writer.delete_folder_by_path(&dir).await {
            Ok(id) => progress.record(folder_result(&dir, id, ChangeAction::Deleted, None)),
            Err(err) => progress.record(folder_result(
                &dir,
                String::new(),
                ChangeAction::Deleted,
                Some(err),
            )),
        }
    }
    Ok(ApplyOutcome::Completed)
}

fn folder_result(
    dir: &str,
    name: String,
    action: ChangeAction,
    error: Option<SyncError>,
) -> JobResourceResult {
    JobResourceResult {
        path: dir.to_string(),
        name,
        group: FOLDER_GROUP.to_string(),
        kind: FOLDER_KIND.to_string(),
        action,
        error,
    }
}
