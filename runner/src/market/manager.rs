//! Background ingestion loop (spec.md §4.5).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::Semaphore;

use crate::db::klines::KlineStore;
use crate::db::models::SeriesKey;
use crate::market::venue::{FetchCandlesParams, VenueAdapter};
use crate::market::Interval;

const INTER_SYMBOL_PACE: Duration = Duration::from_millis(150);
const INTER_PAGE_PACE: Duration = Duration::from_millis(120);
const MAX_PAGE_ITERATIONS: usize = 1000;
const TRIM_INTERVAL_SECS: i64 = 3600;
const PAGE_LIMIT: u32 = 1000;

/// Discovers the set of symbols currently worth ingesting — typically
/// "projects whose status is live/running" (spec.md §4.5 step 1).
#[async_trait]
pub trait ActiveSymbolProvider: Send + Sync {
    async fn active_symbols(&self) -> anyhow::Result<Vec<String>>;
}

fn dedupe_normalize(symbols: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for s in symbols {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            continue;
        }
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

pub struct KlineManager {
    exchange: String,
    interval: Interval,
    store: Arc<dyn KlineStore>,
    venue: Arc<dyn VenueAdapter>,
    cache: Arc<crate::market::SeriesCache>,
    symbols: Arc<dyn ActiveSymbolProvider>,
    history_days: i64,
    max_concurrency: usize,
    poll_every: Duration,
    stop_flag: Arc<AtomicBool>,
    last_trim_at: AtomicI64,
}

impl KlineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: impl Into<String>,
        interval: Interval,
        store: Arc<dyn KlineStore>,
        venue: Arc<dyn VenueAdapter>,
        cache: Arc<crate::market::SeriesCache>,
        symbols: Arc<dyn ActiveSymbolProvider>,
        history_days: i64,
        max_concurrency: usize,
        poll_every: Duration,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            interval,
            store,
            venue,
            cache,
            symbols,
            history_days,
            max_concurrency: max_concurrency.max(1),
            poll_every,
            stop_flag: Arc::new(AtomicBool::new(false)),
            last_trim_at: AtomicI64::new(0),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Runs the ingestion loop until `stop()` is called. Per-tick errors are
    /// caught and logged; the loop continues (spec.md §4.5, §7).
    pub async fn run(&self, now_ms: impl Fn() -> i64 + Send + Sync + 'static) {
        let now_ms = Arc::new(now_ms);
        let mut ticker = tokio::time::interval(self.poll_every);
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            ticker.tick().await;
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.tick(Arc::clone(&now_ms)).await {
                tracing::error!(error = %e, "kline manager tick failed");
            }
        }
    }

    async fn tick(&self, now_ms: Arc<dyn Fn() -> i64 + Send + Sync>) -> anyhow::Result<()> {
        let symbols = dedupe_normalize(self.symbols.active_symbols().await?);
        self.fan_out(&symbols, Arc::clone(&now_ms)).await;

        let now = now_ms();
        let last_trim = self.last_trim_at.load(Ordering::SeqCst);
        if now - last_trim >= TRIM_INTERVAL_SECS * 1000 {
            self.trim_all(&symbols, now).await;
            self.last_trim_at.store(now, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn fan_out(&self, symbols: &[String], now_ms: Arc<dyn Fn() -> i64 + Send + Sync>) {
        let in_flight: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if !in_flight.insert(symbol.clone()) {
                continue;
            }
            let permit = Arc::clone(&semaphore);
            let symbol = symbol.clone();
            let exchange = self.exchange.clone();
            let interval = self.interval;
            let store = Arc::clone(&self.store);
            let venue = Arc::clone(&self.venue);
            let cache = Arc::clone(&self.cache);
            let history_days = self.history_days;
            let in_flight = Arc::clone(&in_flight);
            let now_ms = Arc::clone(&now_ms);
            let stop_flag = Arc::clone(&self.stop_flag);

            let handle = tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                if stop_flag.load(Ordering::SeqCst) {
                    in_flight.remove(&symbol);
                    return;
                }
                let key = SeriesKey::new(exchange, symbol.clone(), interval);
                if let Err(e) =
                    sync_one(store.as_ref(), venue.as_ref(), &key, history_days, now_ms()).await
                {
                    tracing::warn!(symbol = %symbol, error = %e, "sync failed, retrying next tick");
                } else if let Err(e) = cache.preload(store.as_ref(), &key, None).await {
                    tracing::warn!(symbol = %symbol, error = %e, "cache preload failed");
                }
                tokio::time::sleep(INTER_SYMBOL_PACE).await;
                in_flight.remove(&symbol);
            });
            handles.push(handle);
        }

        for h in handles {
            let _ = h.await;
        }
    }

    async fn trim_all(&self, symbols: &[String], now: i64) {
        let min_open_time = now - self.history_days * 86_400_000;
        for symbol in symbols {
            let key = SeriesKey::new(self.exchange.clone(), symbol.clone(), self.interval);
            if let Err(e) = self.store.trim_old(&key, min_open_time).await {
                tracing::warn!(symbol = %symbol, error = %e, "trim failed");
            }
        }
    }
}

/// Bootstraps a previously-unknown series or tail-syncs an existing one.
pub async fn sync_one(
    store: &dyn KlineStore,
    venue: &dyn VenueAdapter,
    key: &SeriesKey,
    history_days: i64,
    now: i64,
) -> anyhow::Result<()> {
    let interval_ms = key.interval.duration_ms();
    let latest = store.get_latest_open_time(key).await?;

    let (start, end) = match latest {
        None => (now - history_days * 86_400_000, now),
        Some(latest) => {
            let start = latest + interval_ms;
            if start > now - interval_ms {
                return Ok(()); // already up to date
            }
            (start, now)
        }
    };

    let candles = fetch_paged(venue, key, start, end).await?;
    if !candles.is_empty() {
        store.upsert_many(&candles).await?;
    }
    Ok(())
}

/// Paged fetch: advances the cursor by `lastOpenTime + intervalMs`, bounded
/// to `MAX_PAGE_ITERATIONS` iterations (spec.md §4.5).
pub async fn fetch_paged(
    venue: &dyn VenueAdapter,
    key: &SeriesKey,
    start_time: i64,
    end_time: i64,
) -> anyhow::Result<Vec<crate::db::models::Candle>> {
    let interval_ms = key.interval.duration_ms();
    let mut cursor = start_time;
    let mut out = Vec::new();

    for _ in 0..MAX_PAGE_ITERATIONS {
        let mut params = FetchCandlesParams::new(key.symbol.clone(), key.interval);
        params.start_time = Some(cursor);
        params.end_time = Some(end_time);
        params.limit = PAGE_LIMIT;

        let chunk = venue.fetch_candles(&params).await?;
        if chunk.is_empty() {
            break;
        }
        let chunk_len = chunk.len();
        let last_open_time = chunk.iter().map(|c| c.open_time).max().unwrap_or(cursor);
        let next_cursor = last_open_time + interval_ms;

        out.extend(chunk);

        if next_cursor <= cursor {
            break;
        }
        cursor = next_cursor;
        if chunk_len < PAGE_LIMIT as usize {
            break;
        }
        if cursor > end_time {
            break;
        }
        tokio::time::sleep(INTER_PAGE_PACE).await;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;
    use crate::market::venue::FakeVenueAdapter;
    use bigdecimal::BigDecimal;

    fn candle(symbol: &str, open_time: i64, interval_ms: i64) -> crate::db::models::Candle {
        crate::db::models::Candle {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
            open_time,
            open: BigDecimal::from(1),
            high: BigDecimal::from(1),
            low: BigDecimal::from(1),
            close: BigDecimal::from(1),
            volume: BigDecimal::from(1),
            close_time: open_time + interval_ms - 1,
        }
    }

    #[tokio::test]
    async fn tail_sync_fills_gap_then_no_ops() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 3); // t0, t1, t2

        let step = Interval::OneMin.duration_ms();
        let t3 = 3 * step;
        let t4 = 4 * step;

        let venue = FakeVenueAdapter::new();
        venue.push_page("BTCUSDT", t3, vec![candle("BTCUSDT", t3, step), candle("BTCUSDT", t4, step)]);

        let now = 5 * step;
        sync_one(&store, &venue, &key, 30, now).await.unwrap();
        assert_eq!(store.rows_for(&key).len(), 5);

        // Second immediate tick should make zero upserts — the venue has no
        // page registered for the new start_time, so another fetch_paged
        // call returns nothing and the store stays at 5 rows.
        sync_one(&store, &venue, &key, 30, now).await.unwrap();
        assert_eq!(store.rows_for(&key).len(), 5);
    }

    #[test]
    fn dedupe_normalize_upper_cases_and_drops_empty() {
        let out = dedupe_normalize(vec![
            "btcusdt".to_string(),
            "BTCUSDT".to_string(),
            "  ".to_string(),
            "ethusdt".to_string(),
        ]);
        assert_eq!(out, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
