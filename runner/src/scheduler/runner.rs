//! Claim → preload → execute → update-run loop (spec.md §4.8 steps 1-8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::PaperBroker;
use crate::db::logs::LogStore;
use crate::db::models::{ClaimedProject, RunStatus};
use crate::db::positions::PositionStore;
use crate::db::runs::RunStore;
use crate::db::klines::KlineStore;
use crate::indicators::IndicatorEngine;
use crate::market::{Interval, SeriesCache};
use crate::scheduler::{claim, sandbox, tf_scan};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub exchange: String,
    pub default_tf: Interval,
    pub claim_limit: i64,
    pub indicator_max_candles: usize,
    pub sandbox_timeout_ms: u64,
}

/// One project's claimed work, processed start to finish before the next
/// project is even looked at (spec.md §5: "the scheduler loop processes
/// claimed projects sequentially").
pub struct Scheduler {
    runs: Arc<dyn RunStore>,
    positions: Arc<dyn PositionStore>,
    logs: Arc<dyn LogStore>,
    klines: Arc<dyn KlineStore>,
    cache: Arc<SeriesCache>,
    config: SchedulerConfig,
    stop_flag: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        runs: Arc<dyn RunStore>,
        positions: Arc<dyn PositionStore>,
        logs: Arc<dyn LogStore>,
        klines: Arc<dyn KlineStore>,
        cache: Arc<SeriesCache>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runs,
            positions,
            logs,
            klines,
            cache,
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Runs the tick loop until `stop()` is called. Per-tick errors are
    /// caught and logged; the loop continues (spec.md §7).
    pub async fn run(&self, tick_every: Duration) {
        let mut ticker = tokio::time::interval(tick_every);
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            ticker.tick().await;
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let claimed = claim::claim_due(self.runs.as_ref(), self.config.claim_limit).await?;
        for project in claimed {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.process(project).await {
                tracing::error!(error = %e, "project run failed to complete");
            }
        }
        Ok(())
    }

    /// Steps 1-8: start the run record, validate the source, preload every
    /// referenced timeframe per symbol, execute once per symbol, and close
    /// out the run with an aggregated status.
    async fn process(&self, project: ClaimedProject) -> anyhow::Result<()> {
        let run = self
            .runs
            .start_run(project.id, project.owner_id, "paper")
            .await?;

        if project.generated_source.trim().is_empty() {
            self.runs
                .finish_run(
                    run.id,
                    RunStatus::Skipped,
                    Some("generated_source is empty".to_string()),
                    None,
                )
                .await?;
            return Ok(());
        }

        let timeframes = tf_scan::required_timeframes(&project.generated_source);
        let mut skipped = Vec::new();
        let mut first_error: Option<String> = None;

        for symbol in &project.symbols {
            let mut preload_ok = true;
            for tf in &timeframes {
                let interval = Interval::parse_str(tf).unwrap_or_default();
                let key = crate::db::models::SeriesKey::new(self.config.exchange.clone(), symbol.clone(), interval);
                if let Err(e) = self
                    .cache
                    .preload(self.klines.as_ref(), &key, Some(self.config.indicator_max_candles))
                    .await
                {
                    tracing::warn!(symbol = %symbol, tf = %tf, error = %e, "preload failed, skipping symbol");
                    preload_ok = false;
                    break;
                }
            }
            if !preload_ok {
                skipped.push(symbol.clone());
                continue;
            }

            let indicators = IndicatorEngine::new(Arc::clone(&self.cache), self.config.exchange.clone(), symbol.clone());
            let broker = PaperBroker::new(
                Arc::clone(&self.positions),
                Arc::clone(&self.logs),
                Arc::clone(&self.cache),
                project.id,
                project.owner_id,
                self.config.exchange.clone(),
                self.config.default_tf,
            );

            if let Err(e) = sandbox::run_strategy(
                project.generated_source.clone(),
                indicators,
                broker,
                self.config.exchange.clone(),
                symbol.clone(),
                self.config.sandbox_timeout_ms,
            )
            .await
            {
                tracing::warn!(symbol = %symbol, error = %e, "strategy invocation failed");
                first_error.get_or_insert(format!("{symbol}: {e}"));
            }
        }

        let summary = format!(
            "{} symbols run, {} skipped (preload failure)",
            project.symbols.len() - skipped.len(),
            skipped.len()
        );
        let status = if first_error.is_some() { RunStatus::Error } else { RunStatus::Ok };
        self.runs.finish_run(run.id, status, Some(summary), first_error).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::klines::FakeKlineStore;
    use crate::db::logs::FakeLogStore;
    use crate::db::positions::FakePositionStore;
    use crate::db::runs::FakeRunStore;
    use uuid::Uuid;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            exchange: "binance".to_string(),
            default_tf: Interval::OneMin,
            claim_limit: 10,
            indicator_max_candles: 100,
            sandbox_timeout_ms: 2_000,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_source_is_skipped_without_running_the_sandbox() {
        let klines = Arc::new(FakeKlineStore::new());
        let cache = Arc::new(SeriesCache::new(100));
        let runs = Arc::new(FakeRunStore::new());
        let positions: Arc<dyn PositionStore> = Arc::new(FakePositionStore::new());
        let logs: Arc<dyn LogStore> = Arc::new(FakeLogStore::new());

        let project = ClaimedProject {
            id: Uuid::new_v4(),
            owner_id: 1,
            generated_source: "   ".to_string(),
            interval_seconds: 60,
            symbols: vec!["BTCUSDT".to_string()],
        };
        runs.seed_due(vec![project]);

        let scheduler = Scheduler::new(
            Arc::clone(&runs) as Arc<dyn RunStore>,
            positions,
            logs,
            klines,
            cache,
            config(),
        );
        scheduler.tick().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_series_for_the_only_symbol_is_recorded_as_skipped_not_errored() {
        let klines = Arc::new(FakeKlineStore::new());
        let cache = Arc::new(SeriesCache::new(100));
        let runs = Arc::new(FakeRunStore::new());
        let positions: Arc<dyn PositionStore> = Arc::new(FakePositionStore::new());
        let logs: Arc<dyn LogStore> = Arc::new(FakeLogStore::new());

        klines.fail_next();

        let project = ClaimedProject {
            id: Uuid::new_v4(),
            owner_id: 1,
            generated_source: "EMA({tf: \"1m\", length: 5})".to_string(),
            interval_seconds: 60,
            symbols: vec!["BTCUSDT".to_string()],
        };
        runs.seed_due(vec![project]);

        let scheduler = Scheduler::new(
            Arc::clone(&runs) as Arc<dyn RunStore>,
            positions,
            logs,
            klines,
            cache,
            config(),
        );
        scheduler.tick().await.unwrap();
    }
}
