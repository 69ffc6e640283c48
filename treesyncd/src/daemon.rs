use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use treesync_core::StoreClient;

use crate::state::SyncStateStore;
use crate::sync::engine::{
    DEFAULT_CHANGE_TIMEOUT, DEFAULT_PAGE_SIZE, RunOutcome, SyncEngine, SyncMode, SyncOptions,
};
use crate::sync::progress::{DEFAULT_MAX_ERRORS, JobProgress};
use crate::sync::retry::{Backoff, RetryConfig, RetryStore};
use crate::sync::source::{LocalSource, Source};

const DEFAULT_JOB: &str = "treesync";
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u64 = 4;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub store_url: String,
    pub token: String,
    pub source_root: PathBuf,
    pub job: String,
    pub root_title: String,
    pub poll_interval: Duration,
    pub max_errors: usize,
    pub strict_errors: bool,
    pub quota_limit: u64,
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub change_timeout: Duration,
    pub page_size: u32,
    pub state_db: PathBuf,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let store_url =
            std::env::var("TREESYNC_STORE_URL").context("TREESYNC_STORE_URL is not set")?;
        let token = std::env::var("TREESYNC_TOKEN").context("TREESYNC_TOKEN is not set")?;
        let source_root = std::env::var("TREESYNC_SOURCE_DIR")
            .map(|value| expand_with_home(&value, &home))
            .context("TREESYNC_SOURCE_DIR is not set")?;
        let job = std::env::var("TREESYNC_JOB").unwrap_or_else(|_| DEFAULT_JOB.to_string());
        let root_title = std::env::var("TREESYNC_ROOT_TITLE").unwrap_or_else(|_| job.clone());
        let state_db = std::env::var("TREESYNC_STATE_DB")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_state_db);

        let poll_interval =
            Duration::from_secs(read_u64_env("TREESYNC_POLL_SECS", DEFAULT_POLL_SECS));
        // Zero is meaningful for these two: it lifts the limit entirely.
        let max_errors = read_count_env("TREESYNC_MAX_ERRORS", DEFAULT_MAX_ERRORS as u64) as usize;
        let strict_errors = read_bool_env("TREESYNC_STRICT_ERRORS", false);
        let quota_limit = read_count_env("TREESYNC_QUOTA_LIMIT", 0);
        let retry_attempts = read_u64_env("TREESYNC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS) as u32;
        let backoff_base = Duration::from_millis(read_u64_env(
            "TREESYNC_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
        ));
        let backoff_max = Duration::from_secs(read_u64_env(
            "TREESYNC_BACKOFF_MAX_SECS",
            DEFAULT_BACKOFF_MAX_SECS,
        ));
        let backoff_jitter = read_bool_env("TREESYNC_BACKOFF_JITTER", true);
        let change_timeout = Duration::from_secs(read_u64_env(
            "TREESYNC_CHANGE_TIMEOUT_SECS",
            DEFAULT_CHANGE_TIMEOUT.as_secs(),
        ));
        let page_size = read_u64_env("TREESYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE as u64) as u32;

        Ok(Self {
            store_url,
            token,
            source_root,
            job,
            root_title,
            poll_interval,
            max_errors,
            strict_errors,
            quota_limit,
            retry_attempts,
            backoff_base,
            backoff_max,
            backoff_jitter,
            change_timeout,
            page_size,
            state_db,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine,
    source: Arc<dyn Source>,
    state: SyncStateStore,
    cancel: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let client = StoreClient::new(&config.store_url, config.token.clone())
            .context("invalid store url")?;
        let retry = RetryConfig {
            attempts: config.retry_attempts,
            backoff: Backoff::new(
                config.backoff_base,
                2,
                config.backoff_max,
                config.backoff_jitter,
            ),
        };
        let store = Arc::new(RetryStore::new(client, retry, cancel.clone()));
        let source: Arc<dyn Source> = Arc::new(LocalSource::new(config.source_root.clone()));
        let state = SyncStateStore::open(&config.state_db)
            .await
            .context("failed to open state database")?;
        if let Some(last) = state.recent_runs(&config.job, 1).await?.first() {
            info!(job = %config.job, outcome = %last.outcome, "previous run");
        }

        let mut options = SyncOptions::new(config.job.clone(), config.root_title.clone());
        options.max_errors = config.max_errors;
        options.strict_errors = config.strict_errors;
        options.quota_limit = config.quota_limit;
        options.change_timeout = config.change_timeout;
        options.page_size = config.page_size;

        let (progress_tx, mut progress_rx) = watch::channel(JobProgress::default());
        let engine =
            SyncEngine::new(store, Arc::clone(&source), options).with_notifier(progress_tx);
        tokio::spawn(async move {
            // Ends when the engine and its sender are dropped.
            while progress_rx.changed().await.is_ok() {
                let snapshot = progress_rx.borrow_and_update().clone();
                debug!(
                    message = %snapshot.message,
                    processed = snapshot.processed,
                    errors = snapshot.errors,
                    "sync progress"
                );
            }
        });

        Ok(Self {
            config,
            engine,
            source,
            state,
            cancel,
        })
    }

    /// Polls the source until shutdown. `force_full` applies to the first
    /// run only; later runs go incremental whenever they can.
    pub async fn run(self, mut force_full: bool) -> anyhow::Result<()> {
        info!(
            job = %self.config.job,
            source = %self.config.source_root.display(),
            poll_secs = self.config.poll_interval.as_secs(),
            "daemon started"
        );

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        error!(error = %err, "failed waiting for ctrl-c");
                    }
                }
                _ = sigterm.recv() => {}
            }
            info!("shutdown requested");
            cancel.cancel();
        });

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.run_once(force_full).await {
                if self.cancel.is_cancelled() {
                    break;
                }
                error!(job = %self.config.job, error = %err, "sync run failed");
            }
            force_full = false;
        }

        info!("daemon stopped");
        Ok(())
    }

    /// One poll: skip when the source still sits at the stored revision,
    /// otherwise reconcile and persist the outcome.
    pub async fn run_once(&self, force_full: bool) -> anyhow::Result<()> {
        let previous = if force_full {
            None
        } else {
            self.state.last_rev(&self.config.job).await?
        };

        if let Some(previous) = previous.as_deref() {
            let current = self
                .source
                .latest_rev()
                .await
                .context("resolve source revision")?;
            if current == previous {
                debug!(job = %self.config.job, rev = %current, "source unchanged, skipping");
                return Ok(());
            }
        }

        let mode = match previous {
            Some(previous_rev) if self.source.versioned() => SyncMode::Incremental { previous_rev },
            _ => SyncMode::Full,
        };
        let report = self.engine.reconcile(mode, &self.cancel).await?;

        let outcome = outcome_label(&report.outcome);
        self.state
            .append_run(&self.config.job, &outcome, &report.summary)
            .await?;
        if let Some(rev) = &report.rev {
            self.state.set_last_rev(&self.config.job, rev).await?;
        }
        match &report.outcome {
            RunOutcome::Success => {
                info!(job = %self.config.job, processed = report.summary.processed, "run finished");
            }
            RunOutcome::PartialSuccess | RunOutcome::Aborted(_) => {
                warn!(
                    job = %self.config.job,
                    outcome = %outcome,
                    errors = report.summary.error_count,
                    "run finished with problems"
                );
            }
        }
        Ok(())
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Success => "success".to_string(),
        RunOutcome::PartialSuccess => "partial".to_string(),
        RunOutcome::Aborted(reason) => format!("aborted: {reason}"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("treesync")
        .join("state.db")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Like `read_u64_env` but keeps explicit zeros.
fn read_count_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
