//! Per-invocation indicator capability object (spec.md §4.6).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::db::models::SeriesKey;
use crate::indicators::math::{self, Bollinger, Macd};
use crate::indicators::source::Source;
use crate::market::{Interval, SeriesCache};

const DEFAULT_TF: &str = "1m";

fn cache_key(tf: &str, name: &str, source: &str, params: &str) -> String {
    format!("{tf}|{name}|{source}|{params}")
}

/// Scoped to one `(exchange, symbol)` pair and one strategy invocation.
/// Single-threaded by construction, so the memoization tables use
/// `RefCell` rather than a lock (spec.md §4.6, §3).
pub struct IndicatorEngine {
    cache: Arc<SeriesCache>,
    exchange: String,
    symbol: String,
    series_memo: RefCell<HashMap<String, Arc<Vec<f64>>>>,
    scalar_memo: RefCell<HashMap<String, f64>>,
    bool_memo: RefCell<HashMap<String, bool>>,
    struct_memo: RefCell<HashMap<String, Structured>>,
    warned: RefCell<HashSet<(String, String)>>,
}

impl IndicatorEngine {
    pub fn new(cache: Arc<SeriesCache>, exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            cache,
            exchange: exchange.into(),
            symbol: symbol.into(),
            series_memo: RefCell::new(HashMap::new()),
            scalar_memo: RefCell::new(HashMap::new()),
            bool_memo: RefCell::new(HashMap::new()),
            struct_memo: RefCell::new(HashMap::new()),
            warned: RefCell::new(HashSet::new()),
        }
    }

    fn warn_once(&self, indicator: &str, value: &str) {
        let key = (indicator.to_string(), value.to_string());
        if self.warned.borrow_mut().insert(key) {
            tracing::warn!(indicator, value, "unrecognized indicator parameter, using default");
        }
    }

    fn series_values(&self, tf: &str, source: Source) -> Arc<Vec<f64>> {
        let memo_key = cache_key(tf, "_SERIES", source.canonical(), "");
        if let Some(v) = self.series_memo.borrow().get(&memo_key) {
            return Arc::clone(v);
        }
        let interval = Interval::parse_str(tf).unwrap_or_default();
        let key = SeriesKey::new(self.exchange.clone(), self.symbol.clone(), interval);
        let values = self
            .cache
            .get_series(&key)
            .map(|s| source.derive(&s))
            .unwrap_or_default();
        let values = Arc::new(values);
        self.series_memo.borrow_mut().insert(memo_key, Arc::clone(&values));
        values
    }

    fn raw_series(&self, tf: &str) -> Option<Arc<crate::market::Series>> {
        let interval = Interval::parse_str(tf).unwrap_or_default();
        let key = SeriesKey::new(self.exchange.clone(), self.symbol.clone(), interval);
        self.cache.get_series(&key)
    }

    fn resolve_source(&self, name: Option<&str>, default: &str) -> Source {
        let name = name.unwrap_or(default);
        let parsed = Source::parse(name);
        if parsed.canonical() != name && name != "Typical Price" {
            self.warn_once("source", name);
        }
        parsed
    }

    pub fn ema(&self, tf: &str, source: Option<&str>, length: usize) -> f64 {
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "EMA", source.canonical(), &length.to_string());
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let values = self.series_values(tf, source);
        let result = math::last_finite(&math::ema(&values, length));
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn sma(&self, tf: &str, source: Option<&str>, length: usize) -> f64 {
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "SMA", source.canonical(), &length.to_string());
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let values = self.series_values(tf, source);
        let result = math::last_finite(&math::sma(&values, length));
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn wma(&self, tf: &str, source: Option<&str>, length: usize) -> f64 {
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "WMA", source.canonical(), &length.to_string());
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let values = self.series_values(tf, source);
        let result = math::last_finite(&math::wma(&values, length));
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    /// `smoothing` is accepted for forward-compatibility with alternate
    /// smoothing modes; only `"wilder"` is implemented, anything else warns
    /// once and falls back to Wilder (spec.md §4.6).
    pub fn rsi(&self, tf: &str, source: Option<&str>, period: usize, smoothing: Option<&str>) -> f64 {
        if let Some(s) = smoothing {
            if s != "wilder" {
                self.warn_once("rsi_smoothing", s);
            }
        }
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "RSI", source.canonical(), &period.to_string());
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let values = self.series_values(tf, source);
        let result = math::rsi(&values, period);
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn atr(&self, tf: &str, period: usize) -> f64 {
        let key = cache_key(tf, "ATR", "HLC", &period.to_string());
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let result = match self.raw_series(tf) {
            Some(s) => math::atr(&s.highs, &s.lows, &s.closes, period),
            None => f64::NAN,
        };
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn macd(&self, tf: &str, source: Option<&str>, fast: usize, slow: usize, signal: usize) -> Macd {
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "MACD", source.canonical(), &format!("{fast}-{slow}-{signal}"));
        {
            let memo = self.struct_memo.borrow();
            if let Some(Structured::Macd(m)) = memo.get(&key) {
                return *m;
            }
        }
        let values = self.series_values(tf, source);
        let result = math::macd(&values, fast, slow, signal);
        self.struct_memo.borrow_mut().insert(key, Structured::Macd(result));
        result
    }

    pub fn bbands(&self, tf: &str, source: Option<&str>, length: usize, mult: f64) -> Bollinger {
        let source = self.resolve_source(source, "Close");
        let key = cache_key(tf, "BBANDS", source.canonical(), &format!("{length}-{mult}"));
        {
            let memo = self.struct_memo.borrow();
            if let Some(Structured::Bollinger(b)) = memo.get(&key) {
                return *b;
            }
        }
        let values = self.series_values(tf, source);
        let result = math::bollinger(&values, length, mult);
        self.struct_memo
            .borrow_mut()
            .insert(key, Structured::Bollinger(result));
        result
    }

    /// Cumulative (non-session-anchored) VWAP over the whole cached window.
    /// `source` overrides the price term in the numerator; defaults to
    /// Typical Price like every other op's documented default (spec.md
    /// §4.6/§9). Non-finite rows are skipped; NaN if no series or total
    /// volume is 0.
    pub fn vwap(&self, tf: &str, source: Option<&str>) -> f64 {
        let source = self.resolve_source(source, "Typical Price");
        let key = cache_key(tf, "VWAP", source.canonical(), "");
        if let Some(v) = self.scalar_memo.borrow().get(&key) {
            return *v;
        }
        let result = match self.raw_series(tf) {
            Some(s) => {
                let price = source.derive(&s);
                let mut pv_sum = 0.0;
                let mut vol_sum = 0.0;
                for i in 0..s.len() {
                    let p = price[i];
                    let vol = s.volumes[i];
                    if !p.is_finite() || !vol.is_finite() {
                        continue;
                    }
                    pv_sum += p * vol;
                    vol_sum += vol;
                }
                if vol_sum == 0.0 {
                    f64::NAN
                } else {
                    pv_sum / vol_sum
                }
            }
            None => f64::NAN,
        };
        self.scalar_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn breakout_up(&self, tf: &str, lookback: usize, level: Option<f64>) -> bool {
        self.breakout(tf, lookback, level, true)
    }

    pub fn breakout_down(&self, tf: &str, lookback: usize, level: Option<f64>) -> bool {
        self.breakout(tf, lookback, level, false)
    }

    fn breakout(&self, tf: &str, lookback: usize, level: Option<f64>, up: bool) -> bool {
        let key = cache_key(
            tf,
            if up { "BREAKOUT_UP" } else { "BREAKOUT_DOWN" },
            "Close",
            &format!("{lookback}-{level:?}"),
        );
        if let Some(v) = self.bool_memo.borrow().get(&key) {
            return *v;
        }
        let closes = self.series_values(tf, Source::Close);
        let result = breakout_eval(&closes, lookback, level, up);
        self.bool_memo.borrow_mut().insert(key, result);
        result
    }

    pub fn ema_cross_up(&self, tf: &str, fast: usize, slow: usize) -> bool {
        self.cross(tf, "EMA_CROSS_UP", fast, slow, 0, true, CrossKind::Ema)
    }

    pub fn ema_cross_down(&self, tf: &str, fast: usize, slow: usize) -> bool {
        self.cross(tf, "EMA_CROSS_DOWN", fast, slow, 0, false, CrossKind::Ema)
    }

    pub fn sma_cross_up(&self, tf: &str, fast: usize, slow: usize) -> bool {
        self.cross(tf, "SMA_CROSS_UP", fast, slow, 0, true, CrossKind::Sma)
    }

    pub fn macd_cross_up(&self, tf: &str, fast: usize, slow: usize, signal: usize) -> bool {
        self.cross(tf, "MACD_CROSS_UP", fast, slow, signal, true, CrossKind::Macd)
    }

    fn cross(
        &self,
        tf: &str,
        name: &str,
        fast: usize,
        slow: usize,
        signal: usize,
        up: bool,
        kind: CrossKind,
    ) -> bool {
        let key = cache_key(tf, name, "Close", &format!("{fast}-{slow}-{signal}"));
        if let Some(v) = self.bool_memo.borrow().get(&key) {
            return *v;
        }
        let closes = self.series_values(tf, Source::Close);
        let result = match kind {
            CrossKind::Ema => {
                let a = math::ema(&closes, fast);
                let b = math::ema(&closes, slow);
                if up {
                    math::cross_up(&a, &b)
                } else {
                    math::cross_down(&a, &b)
                }
            }
            CrossKind::Sma => {
                let a = math::sma(&closes, fast);
                let b = math::sma(&closes, slow);
                math::cross_up(&a, &b)
            }
            CrossKind::Macd => {
                let ema_fast = math::ema(&closes, fast);
                let ema_slow = math::ema(&closes, slow);
                let macd_line: Vec<f64> = ema_fast.iter().zip(ema_slow.iter()).map(|(&f, &s)| f - s).collect();
                let signal_line = math::ema(&macd_line, signal);
                math::cross_up(&macd_line, &signal_line)
            }
        };
        self.bool_memo.borrow_mut().insert(key, result);
        result
    }
}

#[derive(Clone, Copy)]
enum CrossKind {
    Ema,
    Sma,
    Macd,
}

#[derive(Clone, Copy)]
enum Structured {
    Bollinger(Bollinger),
    Macd(Macd),
}

fn breakout_eval(closes: &[f64], lookback: usize, level: Option<f64>, up: bool) -> bool {
    if closes.is_empty() {
        return false;
    }
    let curr = *closes.last().unwrap();
    if !curr.is_finite() {
        return false;
    }
    if let Some(level) = level {
        if !level.is_finite() {
            return false;
        }
        return if up { curr > level } else { curr < level };
    }
    if closes.len() <= lookback {
        return false;
    }
    let window = &closes[closes.len() - 1 - lookback..closes.len() - 1];
    if window.iter().any(|v| !v.is_finite()) {
        return false;
    }
    if up {
        let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        curr > max
    } else {
        let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
        curr < min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;

    async fn engine_with_closes(closes: &[f64]) -> IndicatorEngine {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        let n = closes.len();
        store.seed_ascending(&key, n);
        // seed_ascending generates synthetic values; overwrite with closes via upsert.
        let mut rows = store.rows_for(&key);
        for (r, &c) in rows.iter_mut().zip(closes.iter()) {
            r.close = bigdecimal::BigDecimal::try_from(c).unwrap();
            r.high = bigdecimal::BigDecimal::try_from(c).unwrap();
            r.low = bigdecimal::BigDecimal::try_from(c).unwrap();
            r.open = bigdecimal::BigDecimal::try_from(c).unwrap();
        }
        store.upsert_many(&rows).await.unwrap();

        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(&store, &key, None).await.unwrap();
        IndicatorEngine::new(cache, "binance", "BTCUSDT")
    }

    #[tokio::test]
    async fn breakout_up_matches_spec_example() {
        let engine = engine_with_closes(&[10.0, 12.0, 11.0, 13.0]).await;
        assert!(engine.breakout_up("1m", 3, None));
        assert!(!engine.breakout_up("1m", 3, Some(14.0)));
    }

    #[tokio::test]
    async fn repeated_ema_call_is_memoized_and_consistent() {
        let engine = engine_with_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).await;
        let a = engine.ema("1m", None, 3);
        let b = engine.ema("1m", None, 3);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_source_name_defaults_to_close_without_panicking() {
        let engine = engine_with_closes(&[1.0, 2.0, 3.0, 4.0]).await;
        let v = engine.sma("1m", Some("Bogus"), 2);
        assert!(v.is_finite() || v.is_nan());
    }
}
