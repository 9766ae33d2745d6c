use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Error;
use crate::helpers::{self, Result};
use crate::models::{Candle, Interval};

#[derive(Debug, Clone, PartialEq)]
pub struct KlineRequest {
    pub symbol: String,
    pub interval: Interval,
    pub limit: usize,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl KlineRequest {
    pub fn latest(symbol: &str, interval: Interval, limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            limit,
            start_time: None,
            end_time: None,
        }
    }

    pub fn range(symbol: &str, interval: Interval, start_time: i64, end_time: i64, limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            limit,
            start_time: Some(start_time),
            end_time: Some(end_time),
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("symbol", self.symbol.clone()),
            ("interval", self.interval.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(start) = self.start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = self.end_time {
            query.push(("endTime", end.to_string()));
        }
        query
    }
}

/// Running totals used to audit rate-limit consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub requests: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Candles in ascending `open_time` order; the last one may still be open.
    async fn klines(&self, request: &KlineRequest) -> Result<Vec<Candle>>;

    /// Drops pooled connections so the next request starts from a fresh session.
    async fn reset_session(&self) {}

    fn traffic(&self) -> TrafficStats {
        TrafficStats::default()
    }

    /// Wall clock the source's candles are measured against.
    fn now_ms(&self) -> i64 {
        helpers::now_ms()
    }
}

fn number(row: &[Value], idx: usize) -> Result<f64> {
    match row.get(idx) {
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|e| Error::Decode(format!("field {idx}: {e}"))),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| Error::Decode(format!("field {idx}: not a float"))),
        _ => Err(Error::Decode(format!("field {idx} missing"))),
    }
}

fn timestamp(row: &[Value], idx: usize) -> Result<i64> {
    row.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Decode(format!("field {idx}: not a timestamp")))
}

/// Parses the exchange's array-of-arrays kline payload; only the first seven
/// fields of each row are used.
pub fn parse_klines(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    rows.iter()
        .map(|row| {
            Ok(Candle {
                open_time: timestamp(row, 0)?,
                open: number(row, 1)?,
                high: number(row, 2)?,
                low: number(row, 3)?,
                close: number(row, 4)?,
                volume: number(row, 5)?,
                close_time: timestamp(row, 6)?,
            })
        })
        .collect()
}
