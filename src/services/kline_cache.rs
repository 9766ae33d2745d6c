use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use polars::prelude::*;

use crate::config::CacheConfig;
use crate::helpers::Result;
use crate::models::{Candle, Interval};

type Key = (String, Interval);

/// Columnar per-key storage, one parquet file per (symbol, interval).
#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.root.join(format!("{}_{}.parquet", symbol, interval))
    }

    pub fn read(&self, symbol: &str, interval: Interval) -> Result<Option<Vec<Candle>>> {
        let path = self.path(symbol, interval);
        if !path.exists() {
            return Ok(None);
        }
        let df = ParquetReader::new(File::open(&path)?).finish()?;
        Ok(Some(frame_to_candles(&df)?))
    }

    /// Rewrites the whole file; written beside the target and renamed into place.
    pub fn write(&self, symbol: &str, interval: Interval, series: &[Candle]) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.path(symbol, interval);
        let tmp = path.with_extension("parquet.tmp");
        let mut df = candles_to_frame(series)?;
        ParquetWriter::new(File::create(&tmp)?).finish(&mut df)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn candles_to_frame(series: &[Candle]) -> Result<DataFrame> {
    let df = df!(
        "open_time" => series.iter().map(|c| c.open_time).collect::<Vec<i64>>(),
        "open" => series.iter().map(|c| c.open).collect::<Vec<f64>>(),
        "high" => series.iter().map(|c| c.high).collect::<Vec<f64>>(),
        "low" => series.iter().map(|c| c.low).collect::<Vec<f64>>(),
        "close" => series.iter().map(|c| c.close).collect::<Vec<f64>>(),
        "volume" => series.iter().map(|c| c.volume).collect::<Vec<f64>>(),
        "close_time" => series.iter().map(|c| c.close_time).collect::<Vec<i64>>(),
    )?;
    Ok(df)
}

fn int_column(df: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let values = df.column(name)?.as_materialized_series().i64()?;
    values
        .into_iter()
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(|| PolarsError::ComputeError(format!("null in column {name}").into()).into())
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let values = df.column(name)?.as_materialized_series().f64()?;
    values
        .into_iter()
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| PolarsError::ComputeError(format!("null in column {name}").into()).into())
}

fn frame_to_candles(df: &DataFrame) -> Result<Vec<Candle>> {
    let open_time = int_column(df, "open_time")?;
    let open = float_column(df, "open")?;
    let high = float_column(df, "high")?;
    let low = float_column(df, "low")?;
    let close = float_column(df, "close")?;
    let volume = float_column(df, "volume")?;
    let close_time = int_column(df, "close_time")?;

    Ok((0..open_time.len())
        .map(|i| Candle {
            open_time: open_time[i],
            open: open[i],
            high: high[i],
            low: low[i],
            close: close[i],
            volume: volume[i],
            close_time: close_time[i],
        })
        .collect())
}

fn is_strictly_ascending(series: &[Candle]) -> bool {
    series.windows(2).all(|w| w[0].open_time < w[1].open_time)
}

fn keep_latest(mut series: Vec<Candle>, target_length: usize) -> Vec<Candle> {
    if series.len() > target_length {
        series.drain(..series.len() - target_length);
    }
    series
}

/// Concatenates, keeps the newest candle per `open_time`, sorts ascending and
/// truncates to the most recent `target_length` candles.
pub fn merge_slow(existing: &[Candle], new_candles: &[Candle], target_length: usize) -> Vec<Candle> {
    let mut by_time = BTreeMap::new();
    for candle in existing.iter().chain(new_candles) {
        by_time.insert(candle.open_time, *candle);
    }
    keep_latest(by_time.into_values().collect(), target_length)
}

/// Merge used by [`KlineCache::update`]. Takes the append-only fast path when
/// the new batch is ascending and starts after the cached series.
pub fn merge(existing: Option<&[Candle]>, new_candles: &[Candle], target_length: usize) -> Vec<Candle> {
    let existing = existing.unwrap_or(&[]);
    let contiguous = match (existing.last(), new_candles.first()) {
        (Some(last), Some(first)) => last.open_time < first.open_time,
        _ => true,
    };

    if contiguous && is_strictly_ascending(existing) && is_strictly_ascending(new_candles) {
        let mut merged = Vec::with_capacity(existing.len() + new_candles.len());
        merged.extend_from_slice(existing);
        merged.extend_from_slice(new_candles);
        keep_latest(merged, target_length)
    } else {
        merge_slow(existing, new_candles, target_length)
    }
}

/// Two-tier kline store. The in-memory map is authoritative for the running
/// process; the disk tier survives restarts and is rewritten on every write.
pub struct KlineCache {
    memory: HashMap<Key, Vec<Candle>>,
    disk: Option<DiskTier>,
}

impl KlineCache {
    pub fn new(config: &CacheConfig) -> Self {
        let disk = config.persist.then(|| DiskTier::new(config.dir.clone()));
        Self {
            memory: HashMap::new(),
            disk,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            memory: HashMap::new(),
            disk: None,
        }
    }

    pub fn with_disk(root: impl AsRef<Path>) -> Self {
        Self {
            memory: HashMap::new(),
            disk: Some(DiskTier::new(root.as_ref())),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn load(&mut self, symbol: &str, interval: Interval) -> Option<Vec<Candle>> {
        let key = (symbol.to_string(), interval);
        if let Some(series) = self.memory.get(&key) {
            return Some(series.clone());
        }

        let disk = self.disk.as_ref()?;
        match disk.read(symbol, interval) {
            Ok(Some(series)) if is_strictly_ascending(&series) => {
                debug!("[{} {}] Promoted {} cached candles from disk", symbol, interval, series.len());
                self.memory.insert(key, series.clone());
                Some(series)
            }
            Ok(Some(_)) => {
                warn!("[{} {}] Disk cache is out of order, ignoring it", symbol, interval);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[{} {}] Failed to read disk cache: {}", symbol, interval, e);
                None
            }
        }
    }

    pub fn save(&mut self, symbol: &str, interval: Interval, series: Vec<Candle>) {
        let series = if is_strictly_ascending(&series) {
            series
        } else {
            merge_slow(&[], &series, usize::MAX)
        };
        self.persist(symbol, interval, &series);
        self.memory.insert((symbol.to_string(), interval), series);
    }

    pub fn update(
        &mut self,
        symbol: &str,
        interval: Interval,
        new_candles: &[Candle],
        target_length: usize,
    ) -> Vec<Candle> {
        let existing = self.load(symbol, interval);
        let merged = merge(existing.as_deref(), new_candles, target_length);
        self.persist(symbol, interval, &merged);
        self.memory.insert((symbol.to_string(), interval), merged.clone());
        merged
    }

    fn persist(&self, symbol: &str, interval: Interval, series: &[Candle]) {
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(symbol, interval, series) {
                error!("[{} {}] Failed to persist kline cache: {}", symbol, interval, e);
            }
        }
    }
}
