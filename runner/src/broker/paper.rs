//! Paper-trading execution surface exposed to sandboxed strategies as `HP`
//! (spec.md §4.7, §6, §8 example 7).

use std::sync::Arc;

use bigdecimal::BigDecimal;
use thiserror::Error;
use uuid::Uuid;

use crate::db::logs::LogStore;
use crate::db::models::{LogLevel, SeriesKey};
use crate::db::positions::{PositionStore, PositionStoreError};
use crate::market::{Interval, SeriesCache};

const CLOSE_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Position(#[from] PositionStoreError),
}

/// Bound to one project/run and one default timeframe; every call is
/// run-to-completion from the strategy's point of view (spec.md §4.8's
/// "cooperative, run-to-completion broker calls").
pub struct PaperBroker {
    positions: Arc<dyn PositionStore>,
    logs: Arc<dyn LogStore>,
    cache: Arc<SeriesCache>,
    project_id: Uuid,
    owner_id: i64,
    exchange: String,
    default_tf: Interval,
}

impl PaperBroker {
    pub fn new(
        positions: Arc<dyn PositionStore>,
        logs: Arc<dyn LogStore>,
        cache: Arc<SeriesCache>,
        project_id: Uuid,
        owner_id: i64,
        exchange: impl Into<String>,
        default_tf: Interval,
    ) -> Self {
        Self {
            positions,
            logs,
            cache,
            project_id,
            owner_id,
            exchange: exchange.into(),
            default_tf,
        }
    }

    fn mark_price(&self, symbol: &str) -> Option<f64> {
        let key = SeriesKey::new(self.exchange.clone(), symbol, self.default_tf);
        self.cache.get_closes(&key).last().copied()
    }

    /// `usd` non-finite or `<= 0` is a warn no-op. An existing open position
    /// is an info no-op (uniqueness violations from a racing writer degrade
    /// to the same outcome). Otherwise opens `qty = usd / price` at the last
    /// cached close (spec.md §4.7).
    pub async fn buy(&self, symbol: &str, usd: f64) -> Result<(), BrokerError> {
        if !usd.is_finite() || usd <= 0.0 {
            self.warn(&format!("buy {symbol} ignored: usd must be finite and positive, got {usd}"))
                .await;
            return Ok(());
        }

        let Some(price) = self.mark_price(symbol) else {
            self.warn(&format!("buy {symbol} ignored: no mark price cached")).await;
            return Ok(());
        };

        let qty = usd / price;
        let qty_dec = BigDecimal::try_from(qty).unwrap_or_default();
        let price_dec = BigDecimal::try_from(price).unwrap_or_default();

        match self
            .positions
            .insert_open(self.project_id, self.owner_id, symbol, qty_dec, price_dec)
            .await
        {
            Ok(_) => {
                self.info(&format!("buy {symbol}: usd={usd} price={price} qty={qty}")).await;
                Ok(())
            }
            Err(PositionStoreError::AlreadyOpen { .. }) => {
                self.info(&format!("buy {symbol} skipped: position already open")).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `pct` non-finite or `<= 0` is a warn no-op; no open position is an
    /// info no-op. Closes `closeFrac = min(1, pct/100)` of the position at
    /// the last cached close; a residual `<= 1e-12` fully closes the row
    /// (spec.md §4.7, §8 example 7).
    pub async fn sell(&self, symbol: &str, pct: f64) -> Result<(), BrokerError> {
        if !pct.is_finite() || pct <= 0.0 {
            self.warn(&format!("sell {symbol} ignored: pct must be finite and positive, got {pct}"))
                .await;
            return Ok(());
        }

        let Some(open) = self.positions.get_open(self.project_id, symbol).await? else {
            self.info(&format!("sell {symbol} skipped: no open position")).await;
            return Ok(());
        };

        let Some(price) = self.mark_price(symbol) else {
            self.warn(&format!("sell {symbol} ignored: no mark price cached")).await;
            return Ok(());
        };

        let qty = open.qty_f64();
        let entry_price = open.entry_price_f64();
        let close_frac = (pct / 100.0).min(1.0);
        let close_qty = qty * close_frac;
        let remaining = qty - close_qty;
        let realized = (price - entry_price) * close_qty;

        let price_dec = BigDecimal::try_from(price).unwrap_or_default();
        let realized_dec = BigDecimal::try_from(realized).unwrap_or_default();

        if remaining <= CLOSE_EPSILON {
            let final_qty = BigDecimal::try_from(remaining.max(0.0)).unwrap_or_default();
            self.positions
                .close(self.project_id, symbol, final_qty, price_dec, realized_dec)
                .await?;
            self.info(&format!(
                "sell {symbol}: pct={pct} price={price} closed, realized_pnl_delta={realized}"
            ))
            .await;
        } else {
            let new_qty = BigDecimal::try_from(remaining).unwrap_or_default();
            self.positions
                .update_partial(self.project_id, symbol, new_qty, price_dec, realized_dec)
                .await?;
            self.info(&format!(
                "sell {symbol}: pct={pct} price={price} remaining_qty={remaining} realized_pnl_delta={realized}"
            ))
            .await;
        }
        Ok(())
    }

    /// Free-form strategy logging surfaced through `HP.log` (spec.md §6).
    /// A logging failure never aborts the run — swallow and tell `tracing`.
    pub async fn log(&self, level: LogLevel, message: &str) {
        self.write(level, message).await;
    }

    async fn info(&self, message: &str) {
        self.write(LogLevel::Info, message).await;
    }

    async fn warn(&self, message: &str) {
        self.write(LogLevel::Warn, message).await;
    }

    async fn write(&self, level: LogLevel, message: &str) {
        if let Err(e) = self
            .logs
            .append(self.project_id, self.owner_id, level, message, None)
            .await
        {
            tracing::warn!(error = %e, "failed to persist strategy log line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;
    use crate::db::logs::FakeLogStore;
    use crate::db::models::SeriesKey;
    use crate::db::positions::FakePositionStore;

    async fn broker_at_price(price: f64) -> (PaperBroker, Arc<FakeLogStore>, Arc<FakeKlineStore>, SeriesKey) {
        let store = Arc::new(FakeKlineStore::new());
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 3);
        let mut rows = store.rows_for(&key);
        for r in rows.iter_mut() {
            r.close = BigDecimal::try_from(price).unwrap();
        }
        store.upsert_many(&rows).await.unwrap();

        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(store.as_ref(), &key, None).await.unwrap();

        let positions: Arc<dyn PositionStore> = Arc::new(FakePositionStore::new());
        let logs = Arc::new(FakeLogStore::new());
        let broker = PaperBroker::new(
            positions,
            Arc::clone(&logs) as Arc<dyn LogStore>,
            cache,
            Uuid::new_v4(),
            1,
            "binance",
            Interval::OneMin,
        );
        (broker, logs, store, key)
    }

    #[tokio::test]
    async fn spec_example_buy_then_two_partial_sells() {
        let store = Arc::new(FakeKlineStore::new());
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 1);

        let positions: Arc<dyn PositionStore> = Arc::new(FakePositionStore::new());
        let logs = Arc::new(FakeLogStore::new());
        let project_id = Uuid::new_v4();

        // mark = 50
        let mut rows = store.rows_for(&key);
        rows[0].close = BigDecimal::from(50);
        store.upsert_many(&rows).await.unwrap();
        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(store.as_ref(), &key, None).await.unwrap();
        let broker = PaperBroker::new(
            Arc::clone(&positions),
            Arc::clone(&logs) as Arc<dyn LogStore>,
            cache,
            project_id,
            1,
            "binance",
            Interval::OneMin,
        );
        broker.buy("BTCUSDT", 100.0).await.unwrap();
        let opened = positions.get_open(project_id, "BTCUSDT").await.unwrap().unwrap();
        assert!((opened.qty_f64() - 2.0).abs() < 1e-9);

        // mark = 60, sell 50%
        let mut rows = store.rows_for(&key);
        rows[0].close = BigDecimal::from(60);
        store.upsert_many(&rows).await.unwrap();
        let cache2 = Arc::new(SeriesCache::new(100));
        cache2.preload(store.as_ref(), &key, None).await.unwrap();
        let broker2 = PaperBroker::new(
            Arc::clone(&positions),
            Arc::clone(&logs) as Arc<dyn LogStore>,
            cache2,
            project_id,
            1,
            "binance",
            Interval::OneMin,
        );
        broker2.sell("BTCUSDT", 50.0).await.unwrap();
        let partial = positions.get_open(project_id, "BTCUSDT").await.unwrap().unwrap();
        assert!((partial.qty_f64() - 1.0).abs() < 1e-9);
        assert!((partial.realized_pnl_f64() - 10.0).abs() < 1e-9);

        // mark = 70, sell 100%
        let mut rows = store.rows_for(&key);
        rows[0].close = BigDecimal::from(70);
        store.upsert_many(&rows).await.unwrap();
        let cache3 = Arc::new(SeriesCache::new(100));
        cache3.preload(store.as_ref(), &key, None).await.unwrap();
        let broker3 = PaperBroker::new(
            Arc::clone(&positions),
            Arc::clone(&logs) as Arc<dyn LogStore>,
            cache3,
            project_id,
            1,
            "binance",
            Interval::OneMin,
        );
        broker3.sell("BTCUSDT", 100.0).await.unwrap();
        assert!(positions.get_open(project_id, "BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_buy_without_selling_is_a_no_op() {
        let (broker, logs, _store, _key) = broker_at_price(50.0).await;
        broker.buy("BTCUSDT", 10.0).await.unwrap();
        broker.buy("BTCUSDT", 10.0).await.unwrap();
        let lines = logs.lines.lock().unwrap();
        assert!(lines.iter().any(|(_, _, m)| m.contains("already open")));
    }

    #[tokio::test]
    async fn non_positive_usd_is_a_warn_no_op() {
        let (broker, logs, _store, _key) = broker_at_price(50.0).await;
        broker.buy("BTCUSDT", -5.0).await.unwrap();
        assert!(logs
            .lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, lvl, _)| matches!(lvl, LogLevel::Warn)));
    }
}
