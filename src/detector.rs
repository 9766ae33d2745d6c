use log::trace;

use crate::config::{DetectorConfig, IntervalRule};
use crate::models::{Candle, Interval, Vote};
use crate::statistics::Ema;

/// Evaluates the per-interval rule over closed candles only. The last
/// element of every series is the in-progress candle and never votes.
#[derive(Debug, Clone)]
pub struct SignalDetector {
    config: DetectorConfig,
}

impl SignalDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn rule(&self, interval: Interval) -> &IntervalRule {
        self.config
            .rules
            .get(&interval)
            .unwrap_or(&self.config.default_rule)
    }

    /// Shortest series (in-progress candle included) that can ever vote.
    pub fn required_len(&self, interval: Interval) -> usize {
        let rule = self.rule(interval);
        let ema_len = if rule.ema_band.is_some() {
            rule.ema_period + 1
        } else {
            0
        };
        rule.min_length.max(ema_len).max(3)
    }

    pub fn detect(&self, interval: Interval, series: &[Candle]) -> Vote {
        if series.len() < self.required_len(interval) {
            return Vote::None;
        }
        let rule = self.rule(interval);
        let closed = &series[..series.len() - 1];
        let latest = &closed[closed.len() - 1];
        let previous = &closed[closed.len() - 2];

        let vote = if latest.is_green() && self.config.sides.long {
            Self::check_long(rule, closed, latest, previous)
        } else if latest.is_red() && self.config.sides.short {
            Self::check_short(rule, closed, latest, previous)
        } else {
            Vote::None
        };
        trace!("{} rule on open {}: {:?}", interval, latest.open_time, vote);
        vote
    }

    fn ema(rule: &IntervalRule, closed: &[Candle]) -> Option<f64> {
        let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
        Ema::latest(&closes, rule.ema_period)
    }

    fn body_ok(rule: &IntervalRule, latest: &Candle, previous: &Candle) -> bool {
        rule.body_ratio
            .map_or(true, |ratio| latest.body() > previous.body() * ratio)
    }

    fn check_long(rule: &IntervalRule, closed: &[Candle], latest: &Candle, previous: &Candle) -> Vote {
        if rule.require_reversal && !previous.is_red() {
            return Vote::None;
        }
        if !Self::body_ok(rule, latest, previous) {
            return Vote::None;
        }
        if let Some(band) = rule.ema_band {
            let Some(ema) = Self::ema(rule, closed) else {
                return Vote::None;
            };
            if !(ema < latest.open && latest.open <= ema * band) {
                return Vote::None;
            }
        }
        Vote::Long
    }

    fn check_short(rule: &IntervalRule, closed: &[Candle], latest: &Candle, previous: &Candle) -> Vote {
        if rule.require_reversal && !previous.is_green() {
            return Vote::None;
        }
        if !Self::body_ok(rule, latest, previous) {
            return Vote::None;
        }
        if let Some(band) = rule.ema_band {
            let Some(ema) = Self::ema(rule, closed) else {
                return Vote::None;
            };
            if !(ema / band <= latest.open && latest.open < ema) {
                return Vote::None;
            }
        }
        Vote::Short
    }
}
