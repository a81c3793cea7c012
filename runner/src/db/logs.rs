//! Per-run log lines visible to a project's owner (spec.md §4.8).
//!
//! A log-append failure must never abort a run — callers ignore the
//! returned error and let `tracing` carry the failure instead.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::LogLevel;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("transport or constraint error: {0}")]
    Db(#[from] sqlx::Error),
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(
        &self,
        project_id: Uuid,
        owner_id: i64,
        level: LogLevel,
        message: &str,
        meta: Option<Value>,
    ) -> Result<(), LogStoreError>;
}

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(
        &self,
        project_id: Uuid,
        owner_id: i64,
        level: LogLevel,
        message: &str,
        meta: Option<Value>,
    ) -> Result<(), LogStoreError> {
        sqlx::query!(
            r#"
            INSERT INTO project_logs (id, project_id, owner_id, level, message, meta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            "#,
            Uuid::new_v4(),
            project_id,
            owner_id,
            level.as_str(),
            message,
            meta,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory double that records appended lines for assertions.
#[derive(Default)]
pub struct FakeLogStore {
    pub lines: std::sync::Mutex<Vec<(Uuid, LogLevel, String)>>,
}

impl FakeLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for FakeLogStore {
    async fn append(
        &self,
        project_id: Uuid,
        _owner_id: i64,
        level: LogLevel,
        message: &str,
        _meta: Option<Value>,
    ) -> Result<(), LogStoreError> {
        self.lines
            .lock()
            .unwrap()
            .push((project_id, level, message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_store_records_appended_lines() {
        let store = FakeLogStore::new();
        let project_id = Uuid::new_v4();
        store
            .append(project_id, 1, LogLevel::Info, "bought 1 BTCUSDT", None)
            .await
            .unwrap();
        assert_eq!(store.lines.lock().unwrap().len(), 1);
    }
}
