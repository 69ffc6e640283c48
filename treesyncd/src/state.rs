#![allow(dead_code)]

use std::{fs, path::Path};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

use crate::sync::progress::JobSummary;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed run summary: {0}")]
    Summary(#[from] serde_json::Error),
}

/// One finished reconciliation as persisted in the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub finished: i64,
    pub outcome: String,
    pub summary: JobSummary,
}

/// Daemon-local bookkeeping in SQLite: the revision each job last synced and
/// a log of finished runs.
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn last_rev(&self, job: &str) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT last_rev FROM job_state WHERE job = ?1")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("last_rev"))
            .transpose()
            .map_err(StateError::from)
    }

    pub async fn set_last_rev(&self, job: &str, rev: &str) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO job_state (job, last_rev, updated) VALUES (?1, ?2, ?3)
             ON CONFLICT(job) DO UPDATE SET
                 last_rev = excluded.last_rev,
                 updated = excluded.updated",
        )
        .bind(job)
        .bind(rev)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_run(
        &self,
        job: &str,
        outcome: &str,
        summary: &JobSummary,
    ) -> Result<(), StateError> {
        let summary_json = serde_json::to_string(summary)?;
        sqlx::query("INSERT INTO run_log (job, finished, outcome, summary) VALUES (?1, ?2, ?3, ?4)")
            .bind(job)
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .bind(outcome)
            .bind(summary_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, job: &str, limit: u32) -> Result<Vec<RunRecord>, StateError> {
        let rows = sqlx::query(
            "SELECT id, finished, outcome, summary FROM run_log
             WHERE job = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(job)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let summary: String = row.try_get("summary")?;
            runs.push(RunRecord {
                id: row.try_get("id")?,
                finished: row.try_get("finished")?,
                outcome: row.try_get("outcome")?,
                summary: serde_json::from_str(&summary)?,
            });
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::progress::ResourceSummary;

    async fn make_store() -> SyncStateStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SyncStateStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn summary_with_message(message: &str) -> JobSummary {
        JobSummary {
            started: "2026-01-01T00:00:00Z".into(),
            message: message.into(),
            total: Some(3),
            processed: 3,
            error_count: 1,
            errors: vec!["writing resource from file a.json: cancelled".into()],
            resources: vec![ResourceSummary {
                group: "default".into(),
                kind: "report".into(),
                created: 2,
                errored: 1,
                ..ResourceSummary::default()
            }],
        }
    }

    #[tokio::test]
    async fn last_rev_roundtrips_and_upserts() {
        let store = make_store().await;
        assert_eq!(store.last_rev("docs").await.unwrap(), None);

        store.set_last_rev("docs", "rev1").await.unwrap();
        assert_eq!(store.last_rev("docs").await.unwrap().as_deref(), Some("rev1"));

        store.set_last_rev("docs", "rev2").await.unwrap();
        assert_eq!(store.last_rev("docs").await.unwrap().as_deref(), Some("rev2"));
    }

    #[tokio::test]
    async fn jobs_do_not_share_revisions() {
        let store = make_store().await;
        store.set_last_rev("docs", "rev1").await.unwrap();
        assert_eq!(store.last_rev("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_log_returns_newest_first_and_respects_the_limit() {
        let store = make_store().await;
        for message in ["first", "second", "third"] {
            store
                .append_run("docs", "success", &summary_with_message(message))
                .await
                .unwrap();
        }
        store
            .append_run("other", "aborted: cancelled", &summary_with_message("x"))
            .await
            .unwrap();

        let runs = store.recent_runs("docs", 2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].summary.message, "third");
        assert_eq!(runs[1].summary.message, "second");
        assert!(runs[0].id > runs[1].id);
        assert!(runs[0].finished > 0);
    }

    #[tokio::test]
    async fn run_summaries_survive_the_roundtrip() {
        let store = make_store().await;
        let summary = summary_with_message("applied 3 changes");
        store.append_run("docs", "partial", &summary).await.unwrap();

        let runs = store.recent_runs("docs", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, "partial");
        assert_eq!(runs[0].summary, summary);
    }
}
