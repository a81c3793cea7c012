//! Restricted strategy VM (spec.md §4.8, §6).
//!
//! `rhai::Engine::new_raw()` ships with no default package, so there is no
//! filesystem/module/`import` surface to disable in the first place —
//! capability injection below is additive, not subtractive. Rhai has no
//! native `async`, so `HP.buy`/`HP.sell` run to completion synchronously
//! inside one `eval_ast_with_scope` call via `Handle::block_on`, each still
//! bounded by the same wall-clock deadline through `on_progress`.

use std::rc::Rc;
use std::time::{Duration, Instant};

use rhai::{CustomType, Dynamic, Engine, Map, Scope, TypeBuilder, AST};
use tokio::runtime::Handle;

use crate::broker::PaperBroker;
use crate::db::models::LogLevel;
use crate::indicators::IndicatorEngine;

#[derive(Debug)]
pub struct SandboxError(pub String);

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SandboxError {}

fn get_str(map: &Map, key: &str, default: &str) -> String {
    map.get(key)
        .and_then(|d| d.clone().into_string().ok())
        .unwrap_or_else(|| default.to_string())
}

fn get_usize(map: &Map, key: &str, default: i64) -> usize {
    map.get(key)
        .and_then(|d| d.as_int().ok())
        .unwrap_or(default)
        .max(1) as usize
}

fn get_f64(map: &Map, key: &str, default: f64) -> f64 {
    map.get(key)
        .and_then(|d| d.as_float().ok().or_else(|| d.as_int().ok().map(|i| i as f64)))
        .unwrap_or(default)
}

fn get_optional_f64(map: &Map, key: &str) -> Option<f64> {
    map.get(key)
        .and_then(|d| d.as_float().ok().or_else(|| d.as_int().ok().map(|i| i as f64)))
}

/// The `HP` capability handle bound into strategy scope. The symbol is
/// always the one this run is bound to — the legacy `(symbol, number)`
/// positional form ignores its symbol argument (spec.md §4.8).
#[derive(Clone)]
struct HpHandle {
    broker: Rc<PaperBroker>,
    handle: Handle,
}

impl HpHandle {
    fn buy_usd(&mut self, symbol: &str, usd: f64) {
        let _ = self.handle.block_on(self.broker.buy(symbol, usd));
    }
    fn sell_pct(&mut self, symbol: &str, pct: f64) {
        let _ = self.handle.block_on(self.broker.sell(symbol, pct));
    }
    fn log(&mut self, level: &str, message: &str) {
        let lvl = match level {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        };
        let _ = self.handle.block_on(self.broker.log(lvl, message));
    }
}

impl CustomType for HpHandle {
    fn build(mut builder: TypeBuilder<Self>) {
        builder.with_name("HP").with_fn("log", |hp: &mut HpHandle, level: &str, message: &str| {
            hp.log(level, message);
        });
    }
}

/// Wires the thirteen indicator functions and the `HP`/`context` globals
/// into a fresh `Engine::new_raw()` for one strategy invocation.
fn build_engine(
    indicators: Rc<IndicatorEngine>,
    broker: Rc<PaperBroker>,
    handle: Handle,
    exchange: String,
    symbol: String,
    deadline: Instant,
) -> (Engine, Scope<'static>) {
    let mut engine = Engine::new_raw();
    engine.set_max_operations(5_000_000);

    engine.on_progress(move |_ops| {
        if Instant::now() > deadline {
            Some(Dynamic::from("strategy exceeded its wall-clock budget".to_string()))
        } else {
            None
        }
    });

    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("EMA", move |params: Map| {
            ind.ema(&get_str(&params, "tf", "1m"), Some(&get_str(&params, "source", "Close")), get_usize(&params, "length", 20))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("SMA", move |params: Map| {
            ind.sma(&get_str(&params, "tf", "1m"), Some(&get_str(&params, "source", "Close")), get_usize(&params, "length", 20))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("WMA", move |params: Map| {
            ind.wma(&get_str(&params, "tf", "1m"), Some(&get_str(&params, "source", "Close")), get_usize(&params, "length", 20))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("RSI", move |params: Map| {
            let smoothing = params.get("smoothing").and_then(|d| d.clone().into_string().ok());
            ind.rsi(
                &get_str(&params, "tf", "1m"),
                Some(&get_str(&params, "source", "Close")),
                get_usize(&params, "period", 14),
                smoothing.as_deref(),
            )
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("ATR", move |params: Map| {
            ind.atr(&get_str(&params, "tf", "1m"), get_usize(&params, "period", 14))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("MACD", move |params: Map| {
            let m = ind.macd(
                &get_str(&params, "tf", "1m"),
                Some(&get_str(&params, "source", "Close")),
                get_usize(&params, "fast", 12),
                get_usize(&params, "slow", 26),
                get_usize(&params, "signal", 9),
            );
            let mut out = Map::new();
            out.insert("macd".into(), Dynamic::from(m.macd));
            out.insert("signal".into(), Dynamic::from(m.signal));
            out.insert("histogram".into(), Dynamic::from(m.histogram));
            out
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("BBANDS", move |params: Map| {
            let b = ind.bbands(
                &get_str(&params, "tf", "1m"),
                Some(&get_str(&params, "source", "Close")),
                get_usize(&params, "length", 20),
                get_f64(&params, "mult", 2.0),
            );
            let mut out = Map::new();
            out.insert("upper".into(), Dynamic::from(b.upper));
            out.insert("middle".into(), Dynamic::from(b.middle));
            out.insert("lower".into(), Dynamic::from(b.lower));
            out
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("VWAP", move |params: Map| {
            ind.vwap(
                &get_str(&params, "tf", "1m"),
                Some(&get_str(&params, "source", "Typical Price")),
            )
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("BREAKOUT_UP", move |params: Map| {
            ind.breakout_up(
                &get_str(&params, "tf", "1m"),
                get_usize(&params, "lookback", 20),
                get_optional_f64(&params, "level"),
            )
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("BREAKOUT_DOWN", move |params: Map| {
            ind.breakout_down(
                &get_str(&params, "tf", "1m"),
                get_usize(&params, "lookback", 20),
                get_optional_f64(&params, "level"),
            )
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("EMA_CROSS_UP", move |params: Map| {
            ind.ema_cross_up(&get_str(&params, "tf", "1m"), get_usize(&params, "fast", 12), get_usize(&params, "slow", 26))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("EMA_CROSS_DOWN", move |params: Map| {
            ind.ema_cross_down(&get_str(&params, "tf", "1m"), get_usize(&params, "fast", 12), get_usize(&params, "slow", 26))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("SMA_CROSS_UP", move |params: Map| {
            ind.sma_cross_up(&get_str(&params, "tf", "1m"), get_usize(&params, "fast", 12), get_usize(&params, "slow", 26))
        });
    }
    {
        let ind = Rc::clone(&indicators);
        engine.register_fn("MACD_CROSS_UP", move |params: Map| {
            ind.macd_cross_up(
                &get_str(&params, "tf", "1m"),
                get_usize(&params, "fast", 12),
                get_usize(&params, "slow", 26),
                get_usize(&params, "signal", 9),
            )
        });
    }

    engine.build_type::<HpHandle>();

    // Object-form `{usd}` / `{pct}` plus legacy positional `(number)` and
    // `(symbol, number)` overloads (spec.md §4.8).
    {
        let bound_symbol = symbol.clone();
        engine.register_fn("buy", move |hp: &mut HpHandle, params: Map| {
            hp.buy_usd(&bound_symbol, get_f64(&params, "usd", f64::NAN));
        });
    }
    {
        let bound_symbol = symbol.clone();
        engine.register_fn("buy", move |hp: &mut HpHandle, usd: f64| {
            hp.buy_usd(&bound_symbol, usd);
        });
    }
    {
        engine.register_fn("buy", move |hp: &mut HpHandle, _symbol: &str, usd: f64| {
            hp.buy_usd(_symbol, usd);
        });
    }
    {
        let bound_symbol = symbol.clone();
        engine.register_fn("sell", move |hp: &mut HpHandle, params: Map| {
            hp.sell_pct(&bound_symbol, get_f64(&params, "pct", f64::NAN));
        });
    }
    {
        let bound_symbol = symbol.clone();
        engine.register_fn("sell", move |hp: &mut HpHandle, pct: f64| {
            hp.sell_pct(&bound_symbol, pct);
        });
    }
    {
        engine.register_fn("sell", move |hp: &mut HpHandle, _symbol: &str, pct: f64| {
            hp.sell_pct(_symbol, pct);
        });
    }

    let mut scope = Scope::new();
    scope.push("HP", HpHandle { broker, handle });

    let mut context = Map::new();
    context.insert("exchange".into(), Dynamic::from(exchange));
    context.insert("symbol".into(), Dynamic::from(symbol));
    scope.push_constant("context", context);

    (engine, scope)
}

pub struct SandboxOutcome {
    pub timed_out: bool,
}

/// Compiles and runs `source` with a `deadline_ms` wall-clock budget. A
/// compile error or script-thrown error surfaces as `Err`; the caller maps
/// that to the run's `error` state (spec.md §4.8 step 8).
pub async fn run_strategy(
    source: String,
    indicators: IndicatorEngine,
    broker: PaperBroker,
    exchange: String,
    symbol: String,
    deadline_ms: u64,
) -> Result<SandboxOutcome, SandboxError> {
    let handle = Handle::current();
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);

    tokio::task::spawn_blocking(move || {
        let indicators = Rc::new(indicators);
        let broker = Rc::new(broker);
        let (engine, mut scope) = build_engine(indicators, broker, handle, exchange, symbol, deadline);

        let ast: AST = engine
            .compile(&source)
            .map_err(|e| SandboxError(format!("compile error: {e}")))?;
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map(|_| SandboxOutcome { timed_out: false })
            .map_err(|e| SandboxError(format!("runtime error: {e}")))
    })
    .await
    .map_err(|e| SandboxError(format!("sandbox task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;
    use crate::db::logs::FakeLogStore;
    use crate::db::models::SeriesKey;
    use crate::db::positions::FakePositionStore;
    use crate::market::{Interval, SeriesCache};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test(flavor = "multi_thread")]
    async fn simple_script_runs_to_completion() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 30);
        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(&store, &key, None).await.unwrap();

        let indicators = IndicatorEngine::new(Arc::clone(&cache), "binance", "BTCUSDT");
        let positions: Arc<dyn crate::db::positions::PositionStore> = Arc::new(FakePositionStore::new());
        let logs: Arc<dyn crate::db::logs::LogStore> = Arc::new(FakeLogStore::new());
        let broker = PaperBroker::new(positions, logs, cache, Uuid::new_v4(), 1, "binance", Interval::OneMin);

        let outcome = run_strategy(
            "let v = EMA(#{tf: \"1m\", length: 5}); v".to_string(),
            indicators,
            broker,
            "binance".to_string(),
            "BTCUSDT".to_string(),
            5_000,
        )
        .await
        .unwrap();
        assert!(!outcome.timed_out);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn infinite_loop_is_killed_by_the_deadline() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 5);
        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(&store, &key, None).await.unwrap();

        let indicators = IndicatorEngine::new(Arc::clone(&cache), "binance", "BTCUSDT");
        let positions: Arc<dyn crate::db::positions::PositionStore> = Arc::new(FakePositionStore::new());
        let logs: Arc<dyn crate::db::logs::LogStore> = Arc::new(FakeLogStore::new());
        let broker = PaperBroker::new(positions, logs, cache, Uuid::new_v4(), 1, "binance", Interval::OneMin);

        let result = run_strategy(
            "let x = 0; loop { x += 1; }".to_string(),
            indicators,
            broker,
            "binance".to_string(),
            "BTCUSDT".to_string(),
            200,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buy_and_sell_through_hp_move_the_ledger() {
        let store = FakeKlineStore::new();
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::OneMin);
        store.seed_ascending(&key, 5);
        let mut rows = store.rows_for(&key);
        for r in rows.iter_mut() {
            r.close = bigdecimal::BigDecimal::from(100);
        }
        store.upsert_many(&rows).await.unwrap();
        let cache = Arc::new(SeriesCache::new(100));
        cache.preload(&store, &key, None).await.unwrap();

        let indicators = IndicatorEngine::new(Arc::clone(&cache), "binance", "BTCUSDT");
        let positions: Arc<dyn crate::db::positions::PositionStore> = Arc::new(FakePositionStore::new());
        let logs: Arc<dyn crate::db::logs::LogStore> = Arc::new(FakeLogStore::new());
        let broker = PaperBroker::new(positions, logs, cache, Uuid::new_v4(), 1, "binance", Interval::OneMin);

        run_strategy(
            r#"HP.buy(#{usd: 100.0}); HP.log("info", "bought");"#.to_string(),
            indicators,
            broker,
            "binance".to_string(),
            "BTCUSDT".to_string(),
            5_000,
        )
        .await
        .unwrap();
    }
}
