//! Paged candle fetch from the upstream venue (spec.md §4.4, §6).

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use thiserror::Error;

use crate::db::models::Candle;
use crate::market::Interval;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct FetchCandlesParams {
    pub symbol: String,
    pub interval: Interval,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: u32,
}

impl FetchCandlesParams {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            start_time: None,
            end_time: None,
            limit: 1000,
        }
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn fetch_candles(&self, params: &FetchCandlesParams) -> Result<Vec<Candle>, VenueError>;
}

const MAX_BODY_PREVIEW: usize = 2048;

pub struct BinanceVenueAdapter {
    client: reqwest::Client,
    base_url: String,
    exchange_id: String,
}

impl BinanceVenueAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("hornpub-runner/0.1")
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            exchange_id: "binance".to_string(),
        }
    }
}

// Positions 0..6 of each row: [openTime, open, high, low, close, volume, closeTime, ...]
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawField {
    Num(f64),
    Str(String),
}

impl RawField {
    fn as_f64(&self) -> f64 {
        match self {
            RawField::Num(n) => *n,
            RawField::Str(s) => s.parse::<f64>().unwrap_or(0.0),
        }
    }
    fn as_i64(&self) -> i64 {
        match self {
            RawField::Num(n) => *n as i64,
            RawField::Str(s) => s.parse::<i64>().unwrap_or(0),
        }
    }
}

fn to_bigdecimal(x: f64) -> BigDecimal {
    // Non-finite values are parsed defensively as 0 (spec.md §4.4) before
    // this conversion ever sees them.
    BigDecimal::try_from(if x.is_finite() { x } else { 0.0 }).unwrap_or_default()
}

#[async_trait]
impl VenueAdapter for BinanceVenueAdapter {
    async fn fetch_candles(&self, params: &FetchCandlesParams) -> Result<Vec<Candle>, VenueError> {
        let limit = params.limit.clamp(1, 1000);
        let mut req = self
            .client
            .get(format!("{}/api/v3/klines", self.base_url))
            .header("Accept", "application/json")
            .query(&[
                ("symbol", params.symbol.as_str()),
                ("interval", params.interval.as_str()),
            ])
            .query(&[("limit", limit)]);
        if let Some(start) = params.start_time {
            req = req.query(&[("startTime", start)]);
        }
        if let Some(end) = params.end_time {
            req = req.query(&[("endTime", end)]);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(MAX_BODY_PREVIEW).collect();
            return Err(VenueError::Upstream {
                status: status.as_u16(),
                body: truncated,
            });
        }

        let rows: Vec<Vec<RawField>> = resp.json().await?;
        let candles = rows
            .into_iter()
            .filter(|row| row.len() >= 7)
            .map(|row| {
                let open_time = row[0].as_i64();
                let open = row[1].as_f64();
                let high = row[2].as_f64();
                let low = row[3].as_f64();
                let close = row[4].as_f64();
                let volume = row[5].as_f64();
                let close_time = row[6].as_i64();
                Candle {
                    exchange: self.exchange_id.clone(),
                    symbol: params.symbol.clone(),
                    interval: params.interval.as_str().to_string(),
                    open_time,
                    open: to_bigdecimal(open),
                    high: to_bigdecimal(high),
                    low: to_bigdecimal(low),
                    close: to_bigdecimal(close),
                    volume: to_bigdecimal(volume),
                    close_time,
                }
            })
            .collect();
        Ok(candles)
    }
}

/// In-memory double for manager unit tests: serves fixed pages keyed by
/// `(symbol, start_time)` and otherwise returns empty.
#[derive(Default)]
pub struct FakeVenueAdapter {
    pub pages: std::sync::Mutex<std::collections::HashMap<(String, i64), Vec<Candle>>>,
}

impl FakeVenueAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, symbol: &str, start_time: i64, candles: Vec<Candle>) {
        self.pages
            .lock()
            .unwrap()
            .insert((symbol.to_string(), start_time), candles);
    }
}

#[async_trait]
impl VenueAdapter for FakeVenueAdapter {
    async fn fetch_candles(&self, params: &FetchCandlesParams) -> Result<Vec<Candle>, VenueError> {
        let key = (params.symbol.clone(), params.start_time.unwrap_or(0));
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}
