//! Durable per-series kline persistence (spec.md §4.3).

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use thiserror::Error;

use crate::db::models::{Candle, SeriesKey};

#[derive(Debug, Error)]
pub enum KlineStoreError {
    #[error("transport or constraint error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("fake store injected failure")]
    Injected,
}

/// Narrow persistence contract the kline manager and series cache depend on.
/// All operations may fail with a transport/constraint error; callers treat
/// errors as retryable at the next tick (spec.md §4.3, §7).
#[async_trait]
pub trait KlineStore: Send + Sync {
    async fn get_latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, KlineStoreError>;

    /// Idempotent bulk upsert keyed on (exchange, symbol, interval, open_time).
    async fn upsert_many(&self, candles: &[Candle]) -> Result<(), KlineStoreError>;

    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<(), KlineStoreError>;

    /// The most recent `limit` candles for `key`, ascending by open-time.
    async fn latest_candles(
        &self,
        key: &SeriesKey,
        limit: usize,
    ) -> Result<Vec<Candle>, KlineStoreError>;
}

/// Per-request payload is bounded by chunking upserts at this size
/// (spec.md §4.3).
const UPSERT_CHUNK_SIZE: usize = 500;

pub struct PgKlineStore {
    pool: PgPool,
}

impl PgKlineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KlineStore for PgKlineStore {
    async fn get_latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, KlineStoreError> {
        let row = sqlx::query!(
            r#"
            SELECT MAX(open_time) AS "max_open_time!: Option<i64>"
              FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3
            "#,
            key.exchange,
            key.symbol,
            key.interval.as_str(),
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.max_open_time)
    }

    async fn upsert_many(&self, candles: &[Candle]) -> Result<(), KlineStoreError> {
        for chunk in candles.chunks(UPSERT_CHUNK_SIZE) {
            let mut tx = self.pool.begin().await?;
            for c in chunk {
                sqlx::query!(
                    r#"
                    INSERT INTO market_klines
                        (exchange, symbol, interval, open_time, open, high, low, close, volume, close_time)
                    VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                    ON CONFLICT (exchange, symbol, interval, open_time)
                    DO UPDATE SET
                        open = EXCLUDED.open,
                        high = EXCLUDED.high,
                        low = EXCLUDED.low,
                        close = EXCLUDED.close,
                        volume = EXCLUDED.volume,
                        close_time = EXCLUDED.close_time
                    "#,
                    c.exchange,
                    c.symbol,
                    c.interval,
                    c.open_time,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                    c.close_time,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<(), KlineStoreError> {
        sqlx::query!(
            r#"
            DELETE FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3 AND open_time < $4
            "#,
            key.exchange,
            key.symbol,
            key.interval.as_str(),
            min_open_time,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_candles(
        &self,
        key: &SeriesKey,
        limit: usize,
    ) -> Result<Vec<Candle>, KlineStoreError> {
        let rows = sqlx::query_as!(
            Candle,
            r#"
            SELECT exchange, symbol, interval, open_time,
                   open, high, low, close, volume, close_time
              FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3
             ORDER BY open_time DESC
             LIMIT $4
            "#,
            key.exchange,
            key.symbol,
            key.interval.as_str(),
            limit as i64,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut rows = rows;
        rows.reverse(); // oldest-first
        Ok(rows)
    }
}

/// In-memory double for manager/cache unit tests.
pub struct FakeKlineStore {
    rows: std::sync::Mutex<std::collections::HashMap<SeriesKey, Vec<Candle>>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl FakeKlineStore {
    pub fn new() -> Self {
        Self {
            rows: std::sync::Mutex::new(std::collections::HashMap::new()),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    pub fn seed_ascending(&self, key: &SeriesKey, n: usize) {
        let mut candles = Vec::with_capacity(n);
        let step = key.interval.duration_ms();
        for i in 0..n {
            let ot = (i as i64) * step;
            candles.push(Candle {
                exchange: key.exchange.clone(),
                symbol: key.symbol.clone(),
                interval: key.interval.as_str().to_string(),
                open_time: ot,
                open: BigDecimal::from(100 + i as i64),
                high: BigDecimal::from(101 + i as i64),
                low: BigDecimal::from(99 + i as i64),
                close: BigDecimal::from(100 + i as i64),
                volume: BigDecimal::from(10),
                close_time: ot + step - 1,
            });
        }
        self.rows.lock().unwrap().insert(key.clone(), candles);
    }

    pub fn rows_for(&self, key: &SeriesKey) -> Vec<Candle> {
        self.rows
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for FakeKlineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KlineStore for FakeKlineStore {
    async fn get_latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, KlineStoreError> {
        if self.take_failure() {
            return Err(KlineStoreError::Injected);
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.iter().map(|c| c.open_time).max()))
    }

    async fn upsert_many(&self, candles: &[Candle]) -> Result<(), KlineStoreError> {
        if self.take_failure() {
            return Err(KlineStoreError::Injected);
        }
        let mut rows = self.rows.lock().unwrap();
        for c in candles {
            let key = SeriesKey::new(
                c.exchange.clone(),
                c.symbol.clone(),
                crate::market::Interval::parse_str(&c.interval).unwrap_or_default(),
            );
            let entry = rows.entry(key).or_default();
            if let Some(existing) = entry.iter_mut().find(|e| e.open_time == c.open_time) {
                *existing = c.clone();
            } else {
                entry.push(c.clone());
                entry.sort_by_key(|c| c.open_time);
            }
        }
        Ok(())
    }

    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<(), KlineStoreError> {
        if self.take_failure() {
            return Err(KlineStoreError::Injected);
        }
        if let Some(entry) = self.rows.lock().unwrap().get_mut(key) {
            entry.retain(|c| c.open_time >= min_open_time);
        }
        Ok(())
    }

    async fn latest_candles(
        &self,
        key: &SeriesKey,
        limit: usize,
    ) -> Result<Vec<Candle>, KlineStoreError> {
        if self.take_failure() {
            return Err(KlineStoreError::Injected);
        }
        let rows = self.rows.lock().unwrap();
        let mut candles = rows.get(key).cloned().unwrap_or_default();
        candles.sort_by_key(|c| c.open_time);
        if candles.len() > limit {
            let start = candles.len() - limit;
            candles = candles[start..].to_vec();
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Interval;

    #[tokio::test]
    async fn upserting_same_candle_twice_is_idempotent() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        let candle = Candle {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            interval: key.interval.as_str().to_string(),
            open_time: 1_000,
            open: BigDecimal::from(1),
            high: BigDecimal::from(2),
            low: BigDecimal::from(1),
            close: BigDecimal::from(1),
            volume: BigDecimal::from(1),
            close_time: 1_999,
        };
        store.upsert_many(&[candle.clone()]).await.unwrap();
        store.upsert_many(&[candle]).await.unwrap();
        assert_eq!(store.rows_for(&key).len(), 1);
    }
}
