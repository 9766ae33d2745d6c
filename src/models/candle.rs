use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    pub fn is_red(&self) -> bool {
        self.close < self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }
}

/// Kline interval as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
}

const MINUTE_MS: i64 = 60_000;

impl Interval {
    pub const ALL: [Interval; 14] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        let minutes = match self {
            Interval::M1 => 1,
            Interval::M3 => 3,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::M30 => 30,
            Interval::H1 => 60,
            Interval::H2 => 120,
            Interval::H4 => 240,
            Interval::H6 => 360,
            Interval::H8 => 480,
            Interval::H12 => 720,
            Interval::D1 => 1_440,
            Interval::D3 => 4_320,
            Interval::W1 => 10_080,
        };
        minutes * MINUTE_MS
    }

    /// Open time of the candle containing `ts`. Weekly candles open on Monday
    /// while the epoch fell on a Thursday, hence the 4 day shift.
    pub fn align(&self, ts: i64) -> i64 {
        let d = self.duration_ms();
        let offset = match self {
            Interval::W1 => 4 * Interval::D1.duration_ms(),
            _ => 0,
        };
        (ts - offset).div_euclid(d) * d + offset
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| Error::InvalidInterval(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parse_and_order() {
        assert_eq!("15m".parse::<Interval>().unwrap(), Interval::M15);
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::H1);
        assert!("7m".parse::<Interval>().is_err());
        assert!(Interval::H1.duration_ms() > Interval::M15.duration_ms());
        assert_eq!(Interval::M5.duration_ms(), 300_000);
    }

    #[test]
    fn test_interval_align() {
        let ts = 1_700_000_123_456;
        let open = Interval::M15.align(ts);
        assert_eq!(open % Interval::M15.duration_ms(), 0);
        assert!(open <= ts && ts < open + Interval::M15.duration_ms());

        // 2024-01-01 was a Monday
        let monday = 1_704_067_200_000;
        assert_eq!(Interval::W1.align(monday + 3_600_000), monday);
    }

    #[test]
    fn test_candle_body() {
        let c = Candle {
            open_time: 0,
            open: 100.0,
            high: 106.0,
            low: 99.0,
            close: 105.0,
            volume: 1.0,
            close_time: 59_999,
        };
        assert!(c.is_green());
        assert!(!c.is_red());
        assert_eq!(c.body(), 5.0);
    }
}
