//! In-memory OHLCV series cache (spec.md §4.2).
//!
//! Keyed the way the teacher's `services/scheduler.rs` keys its task
//! registry (a `DashMap`), generalized from `Uuid -> AbortHandle` to
//! `SeriesKey -> Arc<Series>`. Each `preload` builds a brand-new `Series`
//! off to the side and does exactly one `insert`, so a reader holding the
//! old `Arc` never observes a torn array — the "copy-on-write whole series"
//! discipline spec.md §5 calls for.

use std::sync::Arc;

use dashmap::DashMap;

use crate::db::klines::KlineStore;
use crate::db::models::SeriesKey;

/// Lower bound on cache capacity (spec.md §4.2).
pub const MIN_CACHE_CAP: usize = 50;

/// A contiguous, time-ordered (ascending by open-time) OHLCV bundle for one
/// `(exchange, symbol, interval)`.
#[derive(Debug, Clone, Default)]
pub struct Series {
    pub open_times: Vec<i64>,
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.open_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_times.is_empty()
    }
}

/// Process-wide, injectable series cache. Never performs I/O except through
/// `preload`; `get_series`/`get_closes` are constant-time and never block.
pub struct SeriesCache {
    cap: usize,
    inner: DashMap<SeriesKey, Arc<Series>>,
}

impl SeriesCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(MIN_CACHE_CAP),
            inner: DashMap::new(),
        }
    }

    pub fn get_series(&self, key: &SeriesKey) -> Option<Arc<Series>> {
        self.inner.get(key).map(|r| Arc::clone(r.value()))
    }

    pub fn get_closes(&self, key: &SeriesKey) -> Vec<f64> {
        self.get_series(key)
            .map(|s| s.closes.clone())
            .unwrap_or_default()
    }

    /// Fetch the most recent `min(cacheCap, maxCandles ?? cacheCap)` candles
    /// from the store, oldest-first, and atomically replace any existing
    /// entry. On failure the existing entry (if any) is left untouched.
    pub async fn preload(
        &self,
        store: &dyn KlineStore,
        key: &SeriesKey,
        max_candles: Option<usize>,
    ) -> Result<Arc<Series>, crate::db::klines::KlineStoreError> {
        let limit = max_candles.unwrap_or(self.cap).min(self.cap);
        let candles = store.latest_candles(key, limit).await?;

        let mut series = Series::default();
        series.open_times.reserve(candles.len());
        series.opens.reserve(candles.len());
        series.highs.reserve(candles.len());
        series.lows.reserve(candles.len());
        series.closes.reserve(candles.len());
        series.volumes.reserve(candles.len());
        for c in &candles {
            series.open_times.push(c.open_time);
            series.opens.push(c.open_f64());
            series.highs.push(c.high_f64());
            series.lows.push(c.low_f64());
            series.closes.push(c.close_f64());
            series.volumes.push(c.volume_f64());
        }

        let series = Arc::new(series);
        self.inner.insert(key.clone(), Arc::clone(&series));
        Ok(series)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;
    use crate::market::Interval;

    #[tokio::test]
    async fn preload_result_is_ascending_by_open_time() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 10);

        let cache = SeriesCache::new(100);
        let series = cache.preload(&store, &key, None).await.unwrap();

        let mut sorted = series.open_times.clone();
        sorted.sort_unstable();
        assert_eq!(series.open_times, sorted);
    }

    #[tokio::test]
    async fn failed_preload_leaves_existing_entry_untouched() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "ETHUSDT", Interval::OneMin);
        store.seed_ascending(&key, 5);

        let cache = SeriesCache::new(100);
        cache.preload(&store, &key, None).await.unwrap();
        assert_eq!(cache.get_series(&key).unwrap().len(), 5);

        store.fail_next();
        assert!(cache.preload(&store, &key, None).await.is_err());
        assert_eq!(cache.get_series(&key).unwrap().len(), 5);
    }

    #[test]
    fn cache_cap_floored_at_minimum() {
        let cache = SeriesCache::new(1);
        assert_eq!(cache.cap, MIN_CACHE_CAP);
    }
}
