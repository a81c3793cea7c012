//! Thin wrapper around the atomic claim RPC, plus the symbol discovery used
//! by the kline manager (spec.md §4.5 step 1, §6).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::ClaimedProject;
use crate::db::runs::{RunStore, RunStoreError};
use crate::market::ActiveSymbolProvider;

pub async fn claim_due(store: &dyn RunStore, limit: i64) -> Result<Vec<ClaimedProject>, RunStoreError> {
    store.claim_due_projects(limit).await
}

/// Discovers the distinct set of symbols referenced by projects whose
/// status is in the configured active set.
pub struct DbActiveSymbolProvider {
    pool: PgPool,
    active_statuses: Vec<String>,
}

impl DbActiveSymbolProvider {
    pub fn new(pool: PgPool, active_statuses: Vec<String>) -> Self {
        Self { pool, active_statuses }
    }
}

#[async_trait]
impl ActiveSymbolProvider for DbActiveSymbolProvider {
    async fn active_symbols(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query!(
            r#"SELECT DISTINCT unnest(symbols) AS "symbol!" FROM projects WHERE status = ANY($1)"#,
            &self.active_statuses,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.symbol).collect())
    }
}

/// Fixed-set double for manager/scheduler tests.
pub struct StaticSymbolProvider(pub Vec<String>);

#[async_trait]
impl ActiveSymbolProvider for StaticSymbolProvider {
    async fn active_symbols(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

pub fn shared(pool: PgPool, active_statuses: Vec<String>) -> Arc<dyn ActiveSymbolProvider> {
    Arc::new(DbActiveSymbolProvider::new(pool, active_statuses))
}
