//! Process-environment configuration, loaded once at startup.

use std::env;
use std::time::Duration;

use dotenv::dotenv;

/// Everything the runner needs, resolved eagerly so failures surface at
/// startup rather than mid-tick.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub kline_retention_days: i64,
    pub kline_refresh_every_ms: u64,
    pub kline_max_concurrency: usize,
    pub indicator_max_candles: usize,
    pub active_project_statuses: Vec<String>,
    pub scheduler_tick_ms: u64,
    pub sandbox_timeout_ms: u64,
    pub admin_port: u16,
    pub binance_base_url: String,
}

impl Settings {
    /// Load from `.env` (if present) and the process environment.
    ///
    /// Mandatory variables missing from the environment are a fatal startup
    /// error; everything else falls back to the documented default.
    pub fn new() -> Result<Self, String> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL missing")?;

        let kline_retention_days = env_parse_or("KLINE_RETENTION_DAYS", 30)?;
        let kline_refresh_every_ms =
            env_parse_or::<u64>("KLINE_REFRESH_EVERY_MS", 60_000)?.max(10_000);
        let kline_max_concurrency = env_parse_or("KLINE_MAX_CONCURRENCY", 3usize)?;
        let indicator_max_candles = env_parse_or::<usize>("INDICATOR_MAX_CANDLES", 5_000)?.max(50);
        let active_project_statuses = env::var("ACTIVE_PROJECT_STATUSES")
            .unwrap_or_else(|_| "live,running".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let scheduler_tick_ms = env_parse_or("SCHEDULER_TICK_MS", 2_000u64)?;
        let sandbox_timeout_ms = env_parse_or("SANDBOX_TIMEOUT_MS", 5_000u64)?;
        let admin_port = env_parse_or("ADMIN_PORT", 8090u16)?;
        let binance_base_url = env::var("BINANCE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        Ok(Self {
            database_url,
            kline_retention_days,
            kline_refresh_every_ms,
            kline_max_concurrency,
            indicator_max_candles,
            active_project_statuses,
            scheduler_tick_ms,
            sandbox_timeout_ms,
            admin_port,
            binance_base_url,
        })
    }

    pub fn kline_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.kline_refresh_every_ms)
    }

    pub fn scheduler_tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| format!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_refresh_interval_to_floor() {
        std::env::set_var("DATABASE_URL", "postgres://x/y");
        std::env::set_var("KLINE_REFRESH_EVERY_MS", "500");
        let s = Settings::new().unwrap();
        assert_eq!(s.kline_refresh_every_ms, 10_000);
        std::env::remove_var("KLINE_REFRESH_EVERY_MS");
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn defaults_active_statuses() {
        std::env::set_var("DATABASE_URL", "postgres://x/y");
        std::env::remove_var("ACTIVE_PROJECT_STATUSES");
        let s = Settings::new().unwrap();
        assert_eq!(s.active_project_statuses, vec!["live", "running"]);
        std::env::remove_var("DATABASE_URL");
    }
}
