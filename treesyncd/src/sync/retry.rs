use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use treesync_core::{
    FolderInfo, FolderPayload, RemoteResource, ResourceDocument, ResourceStats, StoreClient,
    StoreError,
};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    factor: u32,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, factor: u32, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            factor,
            max,
            jitter,
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor = u64::from(self.factor.max(1));
        let mut exp = base_ms;
        for _ in 0..attempt.min(16) {
            exp = exp.saturating_mul(factor);
            if exp >= max_ms {
                break;
            }
        }
        let exp = exp.min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempt budget, first call included.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Backoff::new(
                Duration::from_millis(250),
                2,
                Duration::from_secs(10),
                true,
            ),
        }
    }
}

/// Store client wrapper that retries transient failures with capped,
/// jittered backoff. Only unit calls go through here; there is nothing
/// streaming to resume.
pub struct RetryStore {
    inner: StoreClient,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryStore {
    pub fn new(inner: StoreClient, config: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            inner,
            config,
            cancel,
        }
    }

    pub async fn list_resources_all(
        &self,
        page_size: u32,
    ) -> Result<Vec<RemoteResource>, StoreError> {
        self.run(async || self.inner.list_resources_all(page_size).await)
            .await
    }

    pub async fn get_stats(&self) -> Result<ResourceStats, StoreError> {
        self.run(async || self.inner.get_stats().await).await
    }

    pub async fn create_folder(
        &self,
        id: &str,
        payload: &FolderPayload,
    ) -> Result<FolderInfo, StoreError> {
        self.run(async || self.inner.create_folder(id, payload).await)
            .await
    }

    pub async fn delete_folder(&self, id: &str) -> Result<(), StoreError> {
        self.run(async || self.inner.delete_folder(id).await).await
    }

    pub async fn upsert_resource(
        &self,
        group: &str,
        kind: &str,
        name: &str,
        document: &ResourceDocument,
    ) -> Result<RemoteResource, StoreError> {
        self.run(async || self.inner.upsert_resource(group, kind, name, document).await)
            .await
    }

    pub async fn delete_resource(
        &self,
        group: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.run(async || self.inner.delete_resource(group, kind, name).await)
            .await
    }

    async fn run<T>(
        &self,
        mut op: impl AsyncFnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.config.attempts && err.is_retryable() => {
                    // A server-suggested wait overrides the computed delay but
                    // stays under the same cap.
                    let wait = match err.retry_after_secs() {
                        Some(seconds) => {
                            Duration::from_secs(seconds).min(self.config.backoff.max())
                        }
                        None => self.config.backoff.delay(attempt),
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
