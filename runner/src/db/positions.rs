//! Paper position ledger (spec.md §4.7).

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::{Position, PositionStatus};

#[derive(Debug, Error)]
pub enum PositionStoreError {
    #[error("transport or constraint error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("project {project_id} already has an open {symbol} position")]
    AlreadyOpen { project_id: Uuid, symbol: String },
    #[error("no open position for project {project_id} symbol {symbol}")]
    NoOpenPosition { project_id: Uuid, symbol: String },
}

/// At most one open position per `(project_id, symbol)` (spec.md §4.7,
/// enforced in Postgres by a partial unique index).
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get_open(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>, PositionStoreError>;

    async fn insert_open(
        &self,
        project_id: Uuid,
        owner_id: i64,
        symbol: &str,
        qty: BigDecimal,
        entry_price: BigDecimal,
    ) -> Result<Position, PositionStoreError>;

    /// Reduces `qty` in place, records the latest exit mark, and accumulates
    /// `realized_pnl_delta` onto the running total. Used for a partial sell
    /// that leaves `remaining > 1e-12` (spec.md §4.7).
    async fn update_partial(
        &self,
        project_id: Uuid,
        symbol: &str,
        new_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError>;

    /// Marks the position closed, recording the final exit mark and
    /// accumulating `realized_pnl_delta` (spec.md §4.7).
    async fn close(
        &self,
        project_id: Uuid,
        symbol: &str,
        final_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError>;
}

pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Postgres unique-violation error code (spec.md §7: "uniqueness
/// violations surface as a domain-level already-open error, never a raw
/// database error").
const UNIQUE_VIOLATION: &str = "23505";

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn get_open(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>, PositionStoreError> {
        let row = sqlx::query_as!(
            Position,
            r#"
            SELECT id, project_id, owner_id, symbol, side, status, qty, entry_price, entry_time,
                   exit_price, exit_time, realized_pnl
              FROM project_positions
             WHERE project_id = $1 AND symbol = $2 AND status = $3
            "#,
            project_id,
            symbol,
            PositionStatus::Open.as_str(),
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_open(
        &self,
        project_id: Uuid,
        owner_id: i64,
        symbol: &str,
        qty: BigDecimal,
        entry_price: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let now = Utc::now();
        let result = sqlx::query_as!(
            Position,
            r#"
            INSERT INTO project_positions
                (id, project_id, owner_id, symbol, side, status, qty, entry_price, entry_time,
                 exit_price, exit_time, realized_pnl)
            VALUES ($1, $2, $3, $4, 'long', $5, $6, $7, $8, NULL, NULL, 0)
            RETURNING id, project_id, owner_id, symbol, side, status, qty, entry_price, entry_time,
                      exit_price, exit_time, realized_pnl
            "#,
            Uuid::new_v4(),
            project_id,
            owner_id,
            symbol,
            PositionStatus::Open.as_str(),
            qty,
            entry_price,
            now,
        )
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(PositionStoreError::AlreadyOpen {
                    project_id,
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => Err(PositionStoreError::Db(e)),
        }
    }

    async fn update_partial(
        &self,
        project_id: Uuid,
        symbol: &str,
        new_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let now = Utc::now();
        let row = sqlx::query_as!(
            Position,
            r#"
            UPDATE project_positions
               SET qty = $3, exit_price = $4, exit_time = $5, realized_pnl = realized_pnl + $6
             WHERE project_id = $1 AND symbol = $2 AND status = $7
            RETURNING id, project_id, owner_id, symbol, side, status, qty, entry_price, entry_time,
                      exit_price, exit_time, realized_pnl
            "#,
            project_id,
            symbol,
            new_qty,
            exit_price,
            now,
            realized_pnl_delta,
            PositionStatus::Open.as_str(),
        )
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| PositionStoreError::NoOpenPosition {
            project_id,
            symbol: symbol.to_string(),
        })
    }

    async fn close(
        &self,
        project_id: Uuid,
        symbol: &str,
        final_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let now = Utc::now();
        let row = sqlx::query_as!(
            Position,
            r#"
            UPDATE project_positions
               SET status = $7, qty = $3, exit_price = $4, exit_time = $5,
                   realized_pnl = realized_pnl + $6
             WHERE project_id = $1 AND symbol = $2 AND status = $8
            RETURNING id, project_id, owner_id, symbol, side, status, qty, entry_price, entry_time,
                      exit_price, exit_time, realized_pnl
            "#,
            project_id,
            symbol,
            final_qty,
            exit_price,
            now,
            realized_pnl_delta,
            PositionStatus::Closed.as_str(),
            PositionStatus::Open.as_str(),
        )
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| PositionStoreError::NoOpenPosition {
            project_id,
            symbol: symbol.to_string(),
        })
    }
}

/// In-memory double keyed by `(project_id, symbol)` — at most one slot per
/// key mirrors the partial-unique-index invariant without a database.
#[derive(Default)]
pub struct FakePositionStore {
    open_positions: std::sync::Mutex<std::collections::HashMap<(Uuid, String), Position>>,
}

impl FakePositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for FakePositionStore {
    async fn get_open(&self, project_id: Uuid, symbol: &str) -> Result<Option<Position>, PositionStoreError> {
        Ok(self
            .open_positions
            .lock()
            .unwrap()
            .get(&(project_id, symbol.to_string()))
            .cloned())
    }

    async fn insert_open(
        &self,
        project_id: Uuid,
        owner_id: i64,
        symbol: &str,
        qty: BigDecimal,
        entry_price: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let mut map = self.open_positions.lock().unwrap();
        let key = (project_id, symbol.to_string());
        if map.contains_key(&key) {
            return Err(PositionStoreError::AlreadyOpen {
                project_id,
                symbol: symbol.to_string(),
            });
        }
        let position = Position {
            id: Uuid::new_v4(),
            project_id,
            owner_id,
            symbol: symbol.to_string(),
            side: "long".to_string(),
            status: PositionStatus::Open.as_str().to_string(),
            qty,
            entry_price,
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            realized_pnl: BigDecimal::from(0),
        };
        map.insert(key, position.clone());
        Ok(position)
    }

    async fn update_partial(
        &self,
        project_id: Uuid,
        symbol: &str,
        new_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let mut map = self.open_positions.lock().unwrap();
        let key = (project_id, symbol.to_string());
        let position = map.get_mut(&key).ok_or_else(|| PositionStoreError::NoOpenPosition {
            project_id,
            symbol: symbol.to_string(),
        })?;
        position.qty = new_qty;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(Utc::now());
        position.realized_pnl = &position.realized_pnl + realized_pnl_delta;
        Ok(position.clone())
    }

    async fn close(
        &self,
        project_id: Uuid,
        symbol: &str,
        final_qty: BigDecimal,
        exit_price: BigDecimal,
        realized_pnl_delta: BigDecimal,
    ) -> Result<Position, PositionStoreError> {
        let mut map = self.open_positions.lock().unwrap();
        let key = (project_id, symbol.to_string());
        let mut position = map.remove(&key).ok_or_else(|| PositionStoreError::NoOpenPosition {
            project_id,
            symbol: symbol.to_string(),
        })?;
        position.status = PositionStatus::Closed.as_str().to_string();
        position.qty = final_qty;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(Utc::now());
        position.realized_pnl = &position.realized_pnl + realized_pnl_delta;
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opening_twice_for_same_symbol_is_rejected() {
        let store = FakePositionStore::new();
        let project_id = Uuid::new_v4();
        store
            .insert_open(project_id, 1, "BTCUSDT", BigDecimal::from(1), BigDecimal::from(100))
            .await
            .unwrap();

        let err = store
            .insert_open(project_id, 1, "BTCUSDT", BigDecimal::from(1), BigDecimal::from(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PositionStoreError::AlreadyOpen { .. }));
    }

    #[tokio::test]
    async fn closing_without_an_open_position_errors() {
        let store = FakePositionStore::new();
        let project_id = Uuid::new_v4();
        let err = store
            .close(
                project_id,
                "BTCUSDT",
                BigDecimal::from(0),
                BigDecimal::from(100),
                BigDecimal::from(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PositionStoreError::NoOpenPosition { .. }));
    }
}
