use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::helpers::Result;
use crate::models::Interval;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub exchange: ExchangeConfig,
    pub collector: CollectorConfig,
    pub cache: CacheConfig,
    pub detector: DetectorConfig,
    pub recorder: RecorderConfig,
    pub schedule: ScheduleConfig,
    pub scan: ScanConfig,
}

impl ScannerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: ScannerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.intervals.is_empty() {
            return Err(Error::Config("at least one scan interval is required".into()));
        }
        if self.collector.limit == 0 {
            return Err(Error::Config("collector.limit must be positive".into()));
        }
        if self.collector.fetch_limit <= self.collector.safety_margin {
            return Err(Error::Config(
                "collector.fetch_limit must exceed collector.safety_margin".into(),
            ));
        }
        if self.collector.max_retries == 0 {
            return Err(Error::Config("collector.max_retries must be positive".into()));
        }
        if self.scan.concurrency == 0 {
            return Err(Error::Config("scan.concurrency must be positive".into()));
        }
        if let Some(bad) = self.schedule.minutes.iter().find(|m| **m > 59) {
            return Err(Error::Config(format!("schedule minute {bad} out of range")));
        }
        if let Some(bad) = self.schedule.seconds.iter().find(|s| **s > 59) {
            return Err(Error::Config(format!("schedule second {bad} out of range")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub proxy: Option<String>,
    pub request_timeout_ms: u64,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub session_max_age_secs: u64,
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            proxy: None,
            request_timeout_ms: 10_000,
            max_connections: 100,
            max_connections_per_host: 20,
            session_max_age_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Candles requested on a full fetch; also the cached window length.
    pub limit: usize,
    /// Trailing candles requested on an incremental fetch.
    pub fetch_limit: usize,
    /// Intervals of headroom kept between the staleness bound and `fetch_limit`.
    pub safety_margin: usize,
    /// Cached series shorter than this force a full fetch. Defaults to `limit`.
    pub min_cached_len: Option<usize>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub delay_retry_pause_ms: u64,
    pub delay_tolerance_ms: i64,
}

impl CollectorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn delay_retry_pause(&self) -> Duration {
        Duration::from_millis(self.delay_retry_pause_ms)
    }

    pub fn min_cached_len(&self, limit: usize) -> usize {
        self.min_cached_len.unwrap_or(limit).min(limit)
    }

    /// Largest gap between now and the cached last close time that an
    /// incremental window can still bridge.
    pub fn max_allowed_delay_ms(&self, interval: Interval) -> i64 {
        let bridgeable = self.fetch_limit.saturating_sub(self.safety_margin) as i64;
        interval.duration_ms() * bridgeable
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            fetch_limit: 5,
            safety_margin: 2,
            min_cached_len: None,
            max_retries: 5,
            retry_delay_ms: 1_000,
            delay_retry_pause_ms: 3_000,
            delay_tolerance_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// When false the cache keeps no disk tier.
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("kline_cache"),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalRule {
    pub ema_period: usize,
    /// Latest closed open must sit between the EMA and EMA × band (long) or
    /// EMA / band (short). `None` disables the EMA condition.
    pub ema_band: Option<f64>,
    /// Previous closed candle must have the opposite body direction.
    pub require_reversal: bool,
    /// Latest closed body must exceed the previous body × ratio.
    pub body_ratio: Option<f64>,
    /// Series shorter than this never vote.
    pub min_length: usize,
}

impl Default for IntervalRule {
    fn default() -> Self {
        Self {
            ema_period: 60,
            ema_band: Some(1.0618),
            require_reversal: false,
            body_ratio: None,
            min_length: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideConfig {
    pub long: bool,
    pub short: bool,
}

impl Default for SideConfig {
    fn default() -> Self {
        Self {
            long: true,
            short: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub sides: SideConfig,
    pub default_rule: IntervalRule,
    pub rules: HashMap<Interval, IntervalRule>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            Interval::H1,
            IntervalRule {
                ema_band: Some(1.0618),
                ..IntervalRule::default()
            },
        );
        rules.insert(
            Interval::M5,
            IntervalRule {
                ema_band: Some(1.04382),
                require_reversal: true,
                ..IntervalRule::default()
            },
        );
        rules.insert(
            Interval::M15,
            IntervalRule {
                ema_band: None,
                require_reversal: true,
                body_ratio: Some(0.618),
                min_length: 4,
                ..IntervalRule::default()
            },
        );
        Self {
            sides: SideConfig::default(),
            default_rule: IntervalRule::default(),
            rules,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/history`.
    pub history_dir: Option<PathBuf>,
    pub duplicate_window_minutes: i64,
    /// Relative open price difference below which a signal is a duplicate.
    pub price_tolerance: f64,
    pub retention_days: i64,
    /// Candles after the signal covered by the outcome window.
    pub outcome_candles: i32,
    /// Also reject a same-side signal inside the window whatever its price.
    /// On by default; disable to keep only the price-based check.
    pub reject_same_side_in_window: bool,
}

impl RecorderConfig {
    pub fn history_dir(&self) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("history"))
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("signal_data"),
            history_dir: None,
            duplicate_window_minutes: 15,
            price_tolerance: 0.01,
            retention_days: 3,
            outcome_candles: 12,
            reject_same_side_in_window: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `None` allows every hour.
    pub hours: Option<Vec<u32>>,
    pub minutes: Vec<u32>,
    pub seconds: Vec<u32>,
    pub debug: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hours: None,
            minutes: vec![0, 15, 30, 45],
            seconds: vec![2, 3],
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub concurrency: usize,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub tick_ms: u64,
    pub use_delayed_data: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "DOGEUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            intervals: vec![Interval::M15],
            concurrency: 20,
            batch_size: 80,
            batch_pause_ms: 500,
            tick_ms: 200,
            use_delayed_data: true,
        }
    }
}
