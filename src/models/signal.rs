use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::models::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => f.write_str("LONG"),
            PositionSide::Short => f.write_str("SHORT"),
        }
    }
}

/// Output of one detector evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    None,
    Long,
    Short,
}

impl Vote {
    pub fn weight(&self) -> i32 {
        match self {
            Vote::None => 0,
            Vote::Long => 1,
            Vote::Short => -1,
        }
    }

    /// Direction of a summed vote count; zero is no vote.
    pub fn from_weight(weight: i32) -> Self {
        match weight.signum() {
            1 => Vote::Long,
            -1 => Vote::Short,
            _ => Vote::None,
        }
    }

    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Vote::None => None,
            Vote::Long => Some(PositionSide::Long),
            Vote::Short => Some(PositionSide::Short),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub interval: Interval,
    pub position_side: PositionSide,
    #[serde(with = "ledger_time")]
    pub open_time: NaiveDateTime,
    pub open_price: f64,
    #[serde(with = "ledger_time")]
    pub after_close_time: NaiveDateTime,
    #[serde(default)]
    pub after_high_price: Option<f64>,
    #[serde(default)]
    pub after_low_price: Option<f64>,
    /// Percent move from `open_price` to `after_high_price`.
    #[serde(default)]
    pub rate_of_up_change: Option<f64>,
    /// Percent move from `open_price` to `after_low_price`.
    #[serde(default)]
    pub rate_of_down_change: Option<f64>,
    #[serde(default, with = "ledger_time_opt")]
    pub update_time: Option<NaiveDateTime>,
}

impl Signal {
    /// True once the observation window has closed and the outcome fields
    /// were not yet computed after that point.
    pub fn needs_outcome(&self, now: NaiveDateTime) -> bool {
        if now < self.after_close_time {
            return false;
        }
        match self.update_time {
            Some(updated) => updated <= self.after_close_time,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSignals {
    pub signals: Vec<Signal>,
}

/// One calendar day of recorded signals, keyed by symbol.
pub type Ledger = BTreeMap<String, SymbolSignals>;

mod ledger_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::helpers::LEDGER_TIME_FORMAT;

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(LEDGER_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, LEDGER_TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

mod ledger_time_opt {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::helpers::LEDGER_TIME_FORMAT;

    pub fn serialize<S: Serializer>(t: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.format(LEDGER_TIME_FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => NaiveDateTime::parse_from_str(raw, LEDGER_TIME_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
