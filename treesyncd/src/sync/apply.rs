use std::time::Duration;

use tokio_util::sync::CancellationToken;
use treesync_core::{FOLDER_GROUP, FOLDER_KIND};

use super::diff::ResourceFileChange;
use super::engine::SyncError;
use super::progress::{JobProgressRecorder, JobResourceResult};
use super::safepath;
use super::source::ChangeAction;
use super::writer::{ResourceRef, ResourceWriter};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Completed,
    Aborted(String),
}

/// Applies a change list one entry at a time. Every change yields exactly one
/// recorded result; failures never stop the loop on their own, only the error
/// budget or cancellation do. Changes nested under a failed folder creation
/// are skipped rather than attempted, and a folder deletion is skipped while
/// anything under it failed to delete.
pub(crate) async fn apply_changes(
    writer: &mut ResourceWriter,
    changes: Vec<ResourceFileChange>,
    progress: &mut JobProgressRecorder,
    cancel: &CancellationToken,
    change_timeout: Duration,
) -> ApplyOutcome {
    for change in changes {
        if cancel.is_cancelled() {
            return ApplyOutcome::Aborted("cancelled".to_string());
        }
        if let Some(reason) = progress.too_many_errors() {
            return ApplyOutcome::Aborted(reason);
        }

        if change.action != ChangeAction::Deleted
            && progress.is_nested_under_failed_creation(&change.path)
        {
            progress.record(change_result(
                &change,
                ChangeAction::Ignored,
                Err(SyncError::Skipped {
                    reason: "parent folder creation failed".to_string(),
                }),
            ));
            continue;
        }

        if change.action == ChangeAction::Deleted
            && safepath::is_dir(&change.path)
            && progress.has_failed_deletions_under(&change.path)
        {
            progress.record(change_result(
                &change,
                ChangeAction::Ignored,
                Err(SyncError::Skipped {
                    reason: "folder still contains resources that failed deletion".to_string(),
                }),
            ));
            continue;
        }

        let outcome = match tokio::time::timeout(change_timeout, dispatch(writer, &change)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout {
                seconds: change_timeout.as_secs(),
            }),
        };
        progress.record(change_result(&change, change.action, outcome));
    }
    ApplyOutcome::Completed
}

async fn dispatch(
    writer: &mut ResourceWriter,
    change: &ResourceFileChange,
) -> Result<Option<ResourceRef>, SyncError> {
    match change.action {
        ChangeAction::Created | ChangeAction::Updated => {
            if safepath::is_dir(&change.path) {
                let id = writer.ensure_folder_path_exist(&change.path).await?;
                Ok(Some(folder_ref(id)))
            } else {
                writer
                    .write_resource_from_file(&change.path, change.rev.as_deref())
                    .await
                    .map(Some)
            }
        }
        ChangeAction::Renamed => {
            let Some(previous) = change.previous_path.as_deref() else {
                return Err(SyncError::MissingIdentity {
                    path: change.path.clone(),
                });
            };
            writer
                .rename_resource_file(
                    &change.path,
                    previous,
                    change.rev.as_deref(),
                    change.previous_rev.as_deref(),
                )
                .await
                .map(Some)
        }
        ChangeAction::Deleted => match (&change.existing, change.previous_rev.as_deref()) {
            (Some(existing), _) => {
                writer.delete_existing(existing).await?;
                Ok(Some(ResourceRef {
                    name: existing.name.clone(),
                    group: existing.group.clone(),
                    kind: existing.kind.clone(),
                }))
            }
            (None, Some(previous_rev)) if !safepath::is_dir(&change.path) => writer
                .remove_resource_from_file(&change.path, Some(previous_rev))
                .await
                .map(Some),
            _ => Err(SyncError::MissingIdentity {
                path: change.path.clone(),
            }),
        },
        ChangeAction::Ignored => Ok(None),
    }
}

fn folder_ref(id: String) -> ResourceRef {
    ResourceRef {
        name: id,
        group: FOLDER_GROUP.to_string(),
        kind: FOLDER_KIND.to_string(),
    }
}

fn change_result(
    change: &ResourceFileChange,
    action: ChangeAction,
    outcome: Result<Option<ResourceRef>, SyncError>,
) -> JobResourceResult {
    let (reference, error) = match outcome {
        Ok(reference) => (reference, None),
        // A failed delete already resolved who it was deleting; keep that
        // identity so the summary counts it under the right kind.
        Err(SyncError::Delete {
            group,
            kind,
            name,
            source,
        }) => (
            Some(ResourceRef {
                name: name.clone(),
                group: group.clone(),
                kind: kind.clone(),
            }),
            Some(SyncError::Delete {
                group,
                kind,
                name,
                source,
            }),
        ),
        Err(err) => (None, Some(err)),
    };
    let (name, group, kind) = match (&reference, change.existing.as_ref()) {
        (Some(r), _) => (r.name.clone(), r.group.clone(), r.kind.clone()),
        (None, Some(e)) => (e.name.clone(), e.group.clone(), e.kind.clone()),
        (None, None) if safepath::is_dir(&change.path) => (
            String::new(),
            FOLDER_GROUP.to_string(),
            FOLDER_KIND.to_string(),
        ),
        (None, None) => (String::new(), String::new(), String::new()),
    };
    JobResourceResult {
        path: change.path.clone(),
        name,
        group,
        kind,
        action,
        error,
    }
}
