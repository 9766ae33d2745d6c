use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::CollectorConfig;
use crate::exchange::{KlineRequest, KlineSource, TrafficStats};
use crate::models::{Candle, Interval};
use crate::services::KlineCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    Incremental,
}

/// Result of one `fetch` call. Failures never escape as errors; the caller
/// decides whether to skip the pair for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(Vec<Candle>),
    /// The exchange kept lagging behind the clock for the whole delay-retry
    /// budget; the series is the last response merged into the cache.
    Delayed(Vec<Candle>),
    Exhausted(String),
}

impl FetchOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, FetchOutcome::Fresh(_))
    }

    pub fn into_series(self, accept_delayed: bool) -> Option<Vec<Candle>> {
        match self {
            FetchOutcome::Fresh(series) => Some(series),
            FetchOutcome::Delayed(series) if accept_delayed => Some(series),
            _ => None,
        }
    }
}

pub struct KlineCollector<S: KlineSource + ?Sized> {
    source: Arc<S>,
    cache: Arc<Mutex<KlineCache>>,
    config: CollectorConfig,
}

impl<S: KlineSource + ?Sized> KlineCollector<S> {
    pub fn new(source: Arc<S>, cache: Arc<Mutex<KlineCache>>, config: CollectorConfig) -> Self {
        Self {
            source,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn traffic(&self) -> TrafficStats {
        self.source.traffic()
    }

    pub fn now_ms(&self) -> i64 {
        self.source.now_ms()
    }

    /// Decide between a full and an incremental fetch for one pair.
    pub fn plan(&self, symbol: &str, interval: Interval, limit: usize, use_cache: bool) -> FetchMode {
        if !use_cache {
            return FetchMode::Full;
        }

        let cached = self.cache.lock().load(symbol, interval);
        let Some(series) = cached else {
            return FetchMode::Full;
        };
        let Some(last) = series.last() else {
            return FetchMode::Full;
        };
        if series.len() < self.config.min_cached_len(limit) {
            debug!(
                "[{} {}] Cached series too short ({} < {}), full fetch",
                symbol,
                interval,
                series.len(),
                self.config.min_cached_len(limit)
            );
            return FetchMode::Full;
        }

        let time_diff = self.source.now_ms() - last.close_time;
        let max_allowed = self.config.max_allowed_delay_ms(interval);
        if time_diff > max_allowed {
            debug!(
                "[{} {}] Cache is stale ({} ms > {} ms), full fetch",
                symbol, interval, time_diff, max_allowed
            );
            return FetchMode::Full;
        }
        FetchMode::Incremental
    }

    fn is_delayed(&self, candles: &[Candle]) -> bool {
        candles.last().map_or(false, |last| {
            self.source.now_ms() - last.close_time > self.config.delay_tolerance_ms
        })
    }

    fn store(
        &self,
        symbol: &str,
        interval: Interval,
        mode: FetchMode,
        mut candles: Vec<Candle>,
        limit: usize,
    ) -> Vec<Candle> {
        let mut cache = self.cache.lock();
        match mode {
            FetchMode::Full => {
                if candles.len() > limit {
                    candles.drain(..candles.len() - limit);
                }
                cache.save(symbol, interval, candles.clone());
                cache.load(symbol, interval).unwrap_or(candles)
            }
            FetchMode::Incremental => cache.update(symbol, interval, &candles, limit),
        }
    }

    pub async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        max_retries: u32,
        use_cache: bool,
    ) -> FetchOutcome {
        let mode = self.plan(symbol, interval, limit, use_cache);
        let request = match mode {
            FetchMode::Full => KlineRequest::latest(symbol, interval, limit),
            FetchMode::Incremental => {
                KlineRequest::latest(symbol, interval, self.config.fetch_limit.min(limit))
            }
        };

        let max_retries = max_retries.max(1);
        let mut retries = 0;
        let mut delayed: Option<Vec<Candle>> = None;
        let mut last_error = String::from("no attempt made");

        while retries < max_retries {
            retries += 1;
            match self.source.klines(&request).await {
                Ok(candles) if candles.is_empty() => {
                    warn!("[{} {}] Empty kline response ({}/{})", symbol, interval, retries, max_retries);
                    last_error = "empty response".to_string();
                }
                Ok(candles) => {
                    if !self.is_delayed(&candles) {
                        return FetchOutcome::Fresh(self.store(symbol, interval, mode, candles, limit));
                    }
                    warn!(
                        "[{} {}] Exchange data delayed, last close {} ({}/{})",
                        symbol,
                        interval,
                        candles.last().map_or(0, |c| c.close_time),
                        retries,
                        max_retries
                    );
                    if retries >= max_retries {
                        return FetchOutcome::Delayed(self.store(symbol, interval, mode, candles, limit));
                    }
                    delayed = Some(candles);
                    tokio::time::sleep(self.config.delay_retry_pause()).await;
                    continue;
                }
                Err(e) if e.is_transport() => {
                    warn!(
                        "[{} {}] Transport error: {}. Rebuilding session ({}/{})",
                        symbol, interval, e, retries, max_retries
                    );
                    self.source.reset_session().await;
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!("[{} {}] Fetch failed: {} ({}/{})", symbol, interval, e, retries, max_retries);
                    last_error = e.to_string();
                }
            }

            if retries < max_retries {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        match delayed {
            Some(candles) => FetchOutcome::Delayed(self.store(symbol, interval, mode, candles, limit)),
            None => FetchOutcome::Exhausted(last_error),
        }
    }

    /// Closed range request used by the outcome analysis; bypasses the cache.
    pub async fn fetch_range(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> Option<Vec<Candle>> {
        let request = KlineRequest::range(symbol, interval, start_time, end_time, 1_500);
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.source.klines(&request).await {
                Ok(candles) => return Some(candles),
                Err(e) => {
                    warn!(
                        "[{} {}] Range fetch failed: {} ({}/{})",
                        symbol, interval, e, attempt, self.config.max_retries
                    );
                    if e.is_transport() {
                        self.source.reset_session().await;
                    }
                }
            }
            tokio::time::sleep(self.config.retry_delay()).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::KlineSimulator;

    const START: i64 = 1_735_689_600_000 + 65_000;

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            limit: 70,
            fetch_limit: 5,
            safety_margin: 2,
            retry_delay_ms: 0,
            delay_retry_pause_ms: 0,
            ..CollectorConfig::default()
        }
    }

    fn collector(seed: u64) -> (Arc<KlineSimulator>, KlineCollector<KlineSimulator>) {
        let sim = Arc::new(KlineSimulator::new(seed, START).unwrap());
        let cache = Arc::new(Mutex::new(KlineCache::in_memory()));
        (sim.clone(), KlineCollector::new(sim, cache, fast_config()))
    }

    #[tokio::test]
    async fn test_full_then_incremental() {
        let (sim, collector) = collector(1);

        let first = collector.fetch("BTCUSDT", Interval::M15, 70, 5, false).await;
        let first = first.into_series(false).unwrap();
        assert_eq!(first.len(), 70);
        assert_eq!(sim.last_request().unwrap().limit, 70);

        sim.advance(Interval::M15.duration_ms());
        assert_eq!(collector.plan("BTCUSDT", Interval::M15, 70, true), FetchMode::Incremental);
        let second = collector
            .fetch("BTCUSDT", Interval::M15, 70, 5, true)
            .await
            .into_series(false)
            .unwrap();
        assert_eq!(sim.last_request().unwrap().limit, 5);
        assert_eq!(second.len(), 70);
        assert_eq!(second[..69], first[1..]);
        assert!(second.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[tokio::test]
    async fn test_stale_cache_forces_full_fetch() {
        let (sim, collector) = collector(2);
        collector.fetch("ETHUSDT", Interval::M15, 70, 5, false).await;

        sim.advance(Interval::M15.duration_ms() * 4);
        assert_eq!(collector.plan("ETHUSDT", Interval::M15, 70, true), FetchMode::Full);
        let outcome = collector.fetch("ETHUSDT", Interval::M15, 70, 5, true).await;
        assert!(outcome.is_fresh());
        assert_eq!(sim.last_request().unwrap().limit, 70);
    }

    #[tokio::test]
    async fn test_short_cache_forces_full_fetch() {
        let (_sim, collector) = collector(3);
        collector.fetch("BNBUSDT", Interval::M15, 10, 5, false).await;
        assert_eq!(collector.plan("BNBUSDT", Interval::M15, 70, true), FetchMode::Full);
        assert_eq!(collector.plan("BNBUSDT", Interval::M15, 10, true), FetchMode::Incremental);
        assert_eq!(collector.plan("ADAUSDT", Interval::M15, 10, true), FetchMode::Full);
    }

    #[tokio::test]
    async fn test_transport_errors_rebuild_session() {
        let (sim, collector) = collector(4);
        sim.fail_next(2);

        let outcome = collector.fetch("BTCUSDT", Interval::H1, 70, 5, false).await;
        assert!(outcome.is_fresh());
        assert_eq!(sim.session_resets(), 2);
        assert_eq!(collector.traffic().requests, 3);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_rebuild_session() {
        let (sim, collector) = collector(5);
        sim.reject_next(1);

        let outcome = collector.fetch("BTCUSDT", Interval::H1, 70, 5, false).await;
        assert!(outcome.is_fresh());
        assert_eq!(sim.session_resets(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let (sim, collector) = collector(6);
        sim.fail_next(10);

        let outcome = collector.fetch("BTCUSDT", Interval::M15, 70, 3, false).await;
        assert!(matches!(outcome, FetchOutcome::Exhausted(_)));
        assert_eq!(collector.traffic().requests, 3);
        assert_eq!(outcome.into_series(true), None);
    }

    #[tokio::test]
    async fn test_delayed_exchange() {
        let (sim, collector) = collector(7);
        sim.set_lag(Interval::M15.duration_ms() * 2);

        let outcome = collector.fetch("BTCUSDT", Interval::M15, 70, 3, false).await;
        assert!(matches!(outcome, FetchOutcome::Delayed(_)));
        assert_eq!(collector.traffic().requests, 3);
        assert!(outcome.clone().into_series(false).is_none());
        assert_eq!(outcome.into_series(true).unwrap().len(), 70);
    }

    #[tokio::test]
    async fn test_delay_recovers_before_budget() {
        let (sim, collector) = collector(8);
        sim.set_lag(Interval::M15.duration_ms());

        let lagging = collector.fetch("BTCUSDT", Interval::M15, 70, 1, false).await;
        assert!(matches!(lagging, FetchOutcome::Delayed(_)));

        sim.set_lag(0);
        let fresh = collector.fetch("BTCUSDT", Interval::M15, 70, 3, false).await;
        assert!(fresh.is_fresh());
    }

    #[tokio::test]
    async fn test_fetch_range() {
        let (_sim, collector) = collector(9);
        let step = Interval::M5.duration_ms();
        let end = Interval::M5.align(START);
        let candles = collector
            .fetch_range("BTCUSDT", Interval::M5, end - 12 * step, end)
            .await
            .unwrap();
        assert_eq!(candles.len(), 13);
        assert_eq!(candles[0].open_time, end - 12 * step);
    }
}
