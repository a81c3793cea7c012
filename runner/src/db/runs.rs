//! Run bookkeeping and the atomic claim RPC (spec.md §4.8, §6).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::{ClaimedProject, Run, RunStatus};

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("transport or constraint error: {0}")]
    Db(#[from] sqlx::Error),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Atomically claims every due project and flips it to `running` in the
    /// same statement, so two scheduler instances never double-claim
    /// (spec.md §6).
    async fn claim_due_projects(&self, limit: i64) -> Result<Vec<ClaimedProject>, RunStoreError>;

    async fn start_run(&self, project_id: Uuid, owner_id: i64, mode: &str) -> Result<Run, RunStoreError>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), RunStoreError>;
}

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn claim_due_projects(&self, limit: i64) -> Result<Vec<ClaimedProject>, RunStoreError> {
        let rows = sqlx::query_as!(
            ClaimedProject,
            r#"SELECT id, owner_id, generated_source, interval_seconds, symbols
                 FROM claim_due_projects($1)"#,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn start_run(&self, project_id: Uuid, owner_id: i64, mode: &str) -> Result<Run, RunStoreError> {
        let now = Utc::now();
        let run = sqlx::query_as!(
            Run,
            r#"
            INSERT INTO project_runs (id, project_id, owner_id, mode, status, started_at, finished_at, summary, error)
            VALUES ($1, $2, $3, $4, 'running', $5, NULL, NULL, NULL)
            RETURNING id, project_id, owner_id, mode, status, started_at, finished_at, summary, error
            "#,
            Uuid::new_v4(),
            project_id,
            owner_id,
            mode,
            now,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), RunStoreError> {
        let now = Utc::now();
        sqlx::query!(
            r#"
            UPDATE project_runs
               SET status = $2, finished_at = $3, summary = $4, error = $5
             WHERE id = $1
            "#,
            run_id,
            status.as_str(),
            now,
            summary,
            error,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory double. `claim_due_projects` drains an injected queue once,
/// mirroring the real RPC's "each due project is handed out exactly once"
/// contract without a database round trip.
#[derive(Default)]
pub struct FakeRunStore {
    pending: std::sync::Mutex<Vec<ClaimedProject>>,
    runs: std::sync::Mutex<std::collections::HashMap<Uuid, Run>>,
}

impl FakeRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_due(&self, projects: Vec<ClaimedProject>) {
        *self.pending.lock().unwrap() = projects;
    }

    pub fn run(&self, run_id: Uuid) -> Option<Run> {
        self.runs.lock().unwrap().get(&run_id).cloned()
    }
}

#[async_trait]
impl RunStore for FakeRunStore {
    async fn claim_due_projects(&self, limit: i64) -> Result<Vec<ClaimedProject>, RunStoreError> {
        let mut pending = self.pending.lock().unwrap();
        let take = (limit.max(0) as usize).min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn start_run(&self, project_id: Uuid, owner_id: i64, mode: &str) -> Result<Run, RunStoreError> {
        let run = Run {
            id: Uuid::new_v4(),
            project_id,
            owner_id,
            mode: mode.to_string(),
            status: RunStatus::Running.as_str().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            summary: None,
            error: None,
        };
        self.runs.lock().unwrap().insert(run.id, run.clone());
        Ok(run)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), RunStoreError> {
        if let Some(run) = self.runs.lock().unwrap().get_mut(&run_id) {
            run.status = status.as_str().to_string();
            run.finished_at = Some(Utc::now());
            run.summary = summary;
            run.error = error;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_drains_at_most_the_requested_limit() {
        let store = FakeRunStore::new();
        store.seed_due(vec![
            ClaimedProject {
                id: Uuid::new_v4(),
                owner_id: 1,
                generated_source: "fn strategy() {}".to_string(),
                interval_seconds: 60,
                symbols: vec!["BTCUSDT".to_string()],
            },
            ClaimedProject {
                id: Uuid::new_v4(),
                owner_id: 2,
                generated_source: "fn strategy() {}".to_string(),
                interval_seconds: 60,
                symbols: vec!["ETHUSDT".to_string()],
            },
        ]);

        let claimed = store.claim_due_projects(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let remaining = store.claim_due_projects(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn finish_run_updates_status_and_finished_at() {
        let store = FakeRunStore::new();
        let run = store.start_run(Uuid::new_v4(), 1, "scheduled").await.unwrap();
        store
            .finish_run(run.id, RunStatus::Ok, Some("done".to_string()), None)
            .await
            .unwrap();
        let updated = store.run(run.id).unwrap();
        assert_eq!(updated.status, "ok");
        assert!(updated.finished_at.is_some());
    }
}
