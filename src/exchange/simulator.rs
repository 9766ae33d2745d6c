use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::types::{KlineRequest, KlineSource, TrafficStats};
use crate::errors::Error;
use crate::helpers::{self, Result};
use crate::models::{Candle, Interval};

/// Candles generated behind the clock when a series is first touched.
const HISTORY_CANDLES: i64 = 1_000;
/// Exchange-side cap on a single kline request.
const MAX_LIMIT: usize = 1_500;
/// Approximate size of one serialized kline row.
const ROW_BYTES: u64 = 180;

struct Track {
    rng: StdRng,
    candles: BTreeMap<i64, Candle>,
    last_close: f64,
}

/// Offline kline source. Every (symbol, interval) pair gets its own seeded
/// random walk, so two simulators built with the same seed serve identical
/// candles. The clock is either manual or follows the system clock.
pub struct KlineSimulator {
    seed: u64,
    initial_price: f64,
    normal_dist: Normal<f64>,
    manual_now: Option<AtomicI64>,
    lag_ms: AtomicI64,
    failures: AtomicU32,
    rejections: AtomicU32,
    resets: AtomicU64,
    requests: AtomicU64,
    bytes: AtomicU64,
    tracks: Mutex<HashMap<(String, Interval), Track>>,
    scripted: Mutex<HashMap<(String, Interval), Vec<Candle>>>,
    last_request: Mutex<Option<KlineRequest>>,
}

impl KlineSimulator {
    /// Simulator with a manual clock starting at `start_ms`.
    pub fn new(seed: u64, start_ms: i64) -> Result<Self> {
        Self::build(seed, Some(start_ms))
    }

    /// Simulator whose clock follows the system clock.
    pub fn live(seed: u64) -> Result<Self> {
        Self::build(seed, None)
    }

    fn build(seed: u64, start_ms: Option<i64>) -> Result<Self> {
        let normal_dist =
            Normal::new(0.0, 0.004).map_err(|e| Error::Config(format!("simulator volatility: {e}")))?;
        Ok(Self {
            seed,
            initial_price: 100.0,
            normal_dist,
            manual_now: start_ms.map(AtomicI64::new),
            lag_ms: AtomicI64::new(0),
            failures: AtomicU32::new(0),
            rejections: AtomicU32::new(0),
            resets: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            tracks: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
        })
    }

    pub fn advance(&self, ms: i64) {
        if let Some(now) = &self.manual_now {
            now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    /// Serve candles as if the exchange lagged `ms` behind the clock.
    pub fn set_lag(&self, ms: i64) {
        self.lag_ms.store(ms, Ordering::SeqCst);
    }

    /// The next `count` requests fail with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` requests are rejected with HTTP 429.
    pub fn reject_next(&self, count: u32) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    /// Replace the random walk of one pair with a fixed series.
    pub fn script(&self, symbol: &str, interval: Interval, candles: Vec<Candle>) {
        self.scripted
            .lock()
            .insert((symbol.to_string(), interval), candles);
    }

    pub fn session_resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<KlineRequest> {
        self.last_request.lock().clone()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn track_seed(&self, symbol: &str, interval: Interval) -> u64 {
        symbol
            .bytes()
            .chain(interval.as_str().bytes())
            .fold(self.seed ^ 0xcbf2_9ce4_8422_2325, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            })
    }

    fn next_candle(&self, track: &mut Track, open_time: i64, interval: Interval) -> Candle {
        let open = track.last_close;
        let change = self.normal_dist.sample(&mut track.rng);
        let close = open * (1.0 + change);
        let wick_up = self.normal_dist.sample(&mut track.rng).abs() / 2.0;
        let wick_down = self.normal_dist.sample(&mut track.rng).abs() / 2.0;
        let volume = 100.0 + track.rng.random::<f64>() * 1_000.0;
        track.last_close = close;
        Candle {
            open_time,
            open,
            high: open.max(close) * (1.0 + wick_up),
            low: open.min(close) * (1.0 - wick_down),
            close,
            volume,
            close_time: open_time + interval.duration_ms() - 1,
        }
    }

    fn generated(&self, symbol: &str, interval: Interval, visible_now: i64) -> Vec<Candle> {
        let step = interval.duration_ms();
        let newest = interval.align(visible_now);
        let mut tracks = self.tracks.lock();
        let track = tracks
            .entry((symbol.to_string(), interval))
            .or_insert_with(|| {
                let mut rng = StdRng::seed_from_u64(self.track_seed(symbol, interval));
                let last_close = self.initial_price * (0.5 + rng.random::<f64>());
                Track {
                    rng,
                    candles: BTreeMap::new(),
                    last_close,
                }
            });

        let mut open_time = match track.candles.keys().next_back() {
            Some(last) => last + step,
            None => newest - HISTORY_CANDLES * step,
        };
        while open_time <= newest {
            let candle = self.next_candle(track, open_time, interval);
            track.candles.insert(open_time, candle);
            open_time += step;
        }
        track.candles.range(..=newest).map(|(_, c)| *c).collect()
    }

    fn series(&self, symbol: &str, interval: Interval, visible_now: i64) -> Vec<Candle> {
        let scripted = self
            .scripted
            .lock()
            .get(&(symbol.to_string(), interval))
            .cloned();
        match scripted {
            Some(candles) => candles
                .into_iter()
                .filter(|c| c.open_time <= visible_now)
                .collect(),
            None => self.generated(symbol, interval, visible_now),
        }
    }
}

#[async_trait]
impl KlineSource for KlineSimulator {
    async fn klines(&self, request: &KlineRequest) -> Result<Vec<Candle>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        if Self::take(&self.failures) {
            return Err(Error::Connection("simulated connection reset".to_string()));
        }
        if Self::take(&self.rejections) {
            return Err(Error::Status(429));
        }

        let visible_now = self.now_ms() - self.lag_ms.load(Ordering::SeqCst);
        let end = request.end_time.map_or(visible_now, |end| end.min(visible_now));
        let limit = request.limit.clamp(1, MAX_LIMIT);

        let mut candles: Vec<Candle> = self
            .series(&request.symbol, request.interval, end)
            .into_iter()
            .filter(|c| request.start_time.map_or(true, |start| c.open_time >= start))
            .collect();
        if request.start_time.is_some() {
            candles.truncate(limit);
        } else if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }

        self.bytes
            .fetch_add(candles.len() as u64 * ROW_BYTES, Ordering::SeqCst);
        Ok(candles)
    }

    async fn reset_session(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn traffic(&self) -> TrafficStats {
        TrafficStats {
            requests: self.requests.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
        }
    }

    fn now_ms(&self) -> i64 {
        match &self.manual_now {
            Some(now) => now.load(Ordering::SeqCst),
            None => helpers::now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 1_735_689_600_000;

    #[tokio::test]
    async fn test_latest_window_ends_with_open_candle() {
        let sim = KlineSimulator::new(7, START + 60_000).unwrap();
        let candles = sim
            .klines(&KlineRequest::latest("BTCUSDT", Interval::M15, 5))
            .await
            .unwrap();

        assert_eq!(candles.len(), 5);
        let last = candles.last().unwrap();
        assert_eq!(last.open_time, Interval::M15.align(START + 60_000));
        assert!(last.close_time > sim.now_ms());
        for pair in candles.windows(2) {
            assert_eq!(pair[1].open_time - pair[0].open_time, Interval::M15.duration_ms());
            assert_eq!(pair[1].open, pair[0].close);
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_candles() {
        let a = KlineSimulator::new(42, START).unwrap();
        let b = KlineSimulator::new(42, START).unwrap();
        let req = KlineRequest::latest("ETHUSDT", Interval::H1, 50);
        assert_eq!(a.klines(&req).await.unwrap(), b.klines(&req).await.unwrap());
    }

    #[tokio::test]
    async fn test_series_is_stable_as_clock_moves() {
        let sim = KlineSimulator::new(1, START).unwrap();
        let req = KlineRequest::latest("BTCUSDT", Interval::M5, 10);
        let before = sim.klines(&req).await.unwrap();
        sim.advance(Interval::M5.duration_ms() * 2);
        let after = sim.klines(&req).await.unwrap();
        assert_eq!(before[2..], after[..8]);
    }

    #[tokio::test]
    async fn test_lag_and_failure_injection() {
        let sim = KlineSimulator::new(3, START).unwrap();
        let req = KlineRequest::latest("BTCUSDT", Interval::M15, 3);

        sim.set_lag(Interval::M15.duration_ms());
        let lagging = sim.klines(&req).await.unwrap();
        assert!(lagging.last().unwrap().close_time < sim.now_ms());

        sim.fail_next(1);
        assert!(sim.klines(&req).await.unwrap_err().is_transport());
        sim.reject_next(1);
        assert!(matches!(sim.klines(&req).await, Err(Error::Status(429))));
        assert!(sim.klines(&req).await.is_ok());
        assert_eq!(sim.traffic().requests, 4);
    }

    #[tokio::test]
    async fn test_range_request_and_script() {
        let sim = KlineSimulator::new(5, START).unwrap();
        let step = Interval::M1.duration_ms();
        let script: Vec<Candle> = (0..4)
            .map(|i| Candle {
                open_time: START - 3 * step + i * step,
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 1.0,
                close_time: START - 2 * step + i * step - 1,
            })
            .collect();
        sim.script("XUSDT", Interval::M1, script.clone());

        let req = KlineRequest::range("XUSDT", Interval::M1, START - 2 * step, START, 2);
        assert_eq!(sim.klines(&req).await.unwrap(), script[1..3].to_vec());
        assert_eq!(sim.last_request(), Some(req));
    }
}
