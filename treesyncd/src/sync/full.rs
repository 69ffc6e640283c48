use tokio_util::sync::CancellationToken;
use tracing::info;

use super::apply::{self, ApplyOutcome};
use super::diff;
use super::engine::{ReconcileError, SyncOptions};
use super::progress::JobProgressRecorder;
use super::quota;
use super::retry::RetryStore;
use super::safepath;
use super::source::{ChangeAction, Source};
use super::writer::ResourceWriter;

/// Full reconciliation: lists both sides in their entirety, diffs them and
/// applies the result. Used on first runs, after aborted runs, and whenever
/// the source cannot answer revision diffs.
pub(crate) async fn run(
    writer: &mut ResourceWriter,
    store: &RetryStore,
    source: &dyn Source,
    options: &SyncOptions,
    current_rev: &str,
    progress: &mut JobProgressRecorder,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome, ReconcileError> {
    progress.set_message("ensuring root folder");
    writer
        .ensure_root_folder()
        .await
        .map_err(ReconcileError::RootFolder)?;

    progress.set_message("listing target resources");
    let target = store
        .list_resources_all(options.page_size)
        .await
        .map_err(ReconcileError::ListTarget)?;
    writer.seed_tree(&target);

    progress.set_message("listing source tree");
    let tree = source
        .list_tree(Some(current_rev))
        .await
        .map_err(ReconcileError::ListSource)?;

    let mut changes = diff::changes(&tree, &target)?;
    if changes.is_empty() {
        progress.set_final_message("no changes to sync");
        return Ok(ApplyOutcome::Completed);
    }
    for change in &mut changes {
        change.rev = Some(current_rev.to_string());
    }

    let stats = store.get_stats().await.map_err(ReconcileError::Stats)?;
    quota::check_quota(net_content_change(&changes), &stats, options.quota_limit)?;

    info!(job = %options.job, changes = changes.len(), "applying changes");
    progress.set_total(changes.len());
    progress.set_message("applying changes");
    Ok(apply::apply_changes(writer, changes, progress, cancel, options.change_timeout).await)
}

/// Content documents the run adds minus those it removes; folders are
/// structural and do not count against capacity.
fn net_content_change(changes: &[diff::ResourceFileChange]) -> i64 {
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
