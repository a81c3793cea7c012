//! Row types shared by the kline store, run/log stores, and position ledger.

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::market::Interval;

/// One OHLCV bar, keyed by (exchange, symbol, interval, open_time).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub open: BigDecimal,
    pub high: BigDecimal,
    pub low: BigDecimal,
    pub close: BigDecimal,
    pub volume: BigDecimal,
    pub close_time: i64,
}

impl Candle {
    pub fn open_f64(&self) -> f64 {
        self.open.to_f64().unwrap_or(0.0)
    }
    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }
    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Triple identifying one durable/cached series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            interval,
        }
    }
}

/// Descriptor handed back by the atomic `claim_due_projects` RPC (spec.md §6).
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedProject {
    pub id: Uuid,
    pub owner_id: i64,
    pub generated_source: String,
    pub interval_seconds: i32,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub owner_id: i64,
    pub mode: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Position {
    pub id: Uuid,
    pub project_id: Uuid,
    pub owner_id: i64,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub qty: BigDecimal,
    pub entry_price: BigDecimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<BigDecimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: BigDecimal,
}

impl Position {
    pub fn qty_f64(&self) -> f64 {
        self.qty.to_f64().unwrap_or(0.0)
    }
    pub fn entry_price_f64(&self) -> f64 {
        self.entry_price.to_f64().unwrap_or(0.0)
    }
    pub fn realized_pnl_f64(&self) -> f64 {
        self.realized_pnl.to_f64().unwrap_or(0.0)
    }
}
