use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::errors::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Format used for every timestamp written into a ledger file.
pub const LEDGER_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
/// Format of per-day ledger file stems.
pub const LEDGER_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Milliseconds since epoch for a local wall-clock time. Ambiguous (DST fold)
/// times resolve to the earlier instant; times inside a DST gap fall back to UTC.
pub fn local_to_ms(time: &NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(time)
        .earliest()
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| time.and_utc().timestamp_millis())
}

pub fn ms_to_local(ms: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).naive_local())
        .unwrap_or_default()
}

/// Only plain ASCII tickers are passed on to the executor; listings with
/// non-latin names are dropped.
pub fn is_tradeable_symbol(symbol: &str) -> bool {
    !symbol.is_empty() && symbol.chars().all(|c| c.is_ascii_alphanumeric())
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tradeable_symbol_filter() {
        assert!(is_tradeable_symbol("BTCUSDT"));
        assert!(is_tradeable_symbol("1000PEPEUSDT"));
        assert!(!is_tradeable_symbol("币安人生USDT"));
        assert!(!is_tradeable_symbol("BTC-USDT"));
        assert!(!is_tradeable_symbol(""));
    }

    #[test]
    fn test_local_round_trip() {
        let ms = 1_734_681_600_000;
        assert_eq!(local_to_ms(&ms_to_local(ms)), ms);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-0.4567, 3), -0.457);
    }
}
