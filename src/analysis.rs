use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use futures::stream::{self, StreamExt};
use log::{info, warn};

use crate::collector::KlineCollector;
use crate::exchange::KlineSource;
use crate::helpers::{self, Result};
use crate::models::{Candle, Ledger, Signal};
use crate::recorder::SignalRecorder;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub high: f64,
    pub low: f64,
    /// Percent, two decimals.
    pub up_rate: f64,
    pub down_rate: f64,
}

impl Outcome {
    pub fn from_candles(open_price: f64, candles: &[Candle]) -> Option<Self> {
        let high = candles.iter().map(|c| c.high).reduce(f64::max)?;
        let low = candles.iter().map(|c| c.low).reduce(f64::min)?;
        let rate = |price: f64| {
            if open_price == 0.0 {
                0.0
            } else {
                helpers::round_to((price - open_price) / open_price * 100.0, 2)
            }
        };
        Some(Self {
            high,
            low,
            up_rate: rate(high),
            down_rate: rate(low),
        })
    }

    fn apply(&self, signal: &mut Signal, now: NaiveDateTime) {
        signal.after_high_price = Some(self.high);
        signal.after_low_price = Some(self.low);
        signal.rate_of_up_change = Some(self.up_rate);
        signal.rate_of_down_change = Some(self.down_rate);
        signal.update_time = Some(now);
    }
}

/// Fills the post-signal price excursion of recorded signals once their
/// observation window has closed.
pub struct SignalAnalyzer<S: KlineSource + ?Sized> {
    collector: Arc<KlineCollector<S>>,
    concurrency: usize,
}

impl<S: KlineSource + ?Sized> SignalAnalyzer<S> {
    pub fn new(collector: Arc<KlineCollector<S>>, concurrency: usize) -> Self {
        Self {
            collector,
            concurrency: concurrency.max(1),
        }
    }

    /// Updates every pending signal of `ledger` in place and returns how many
    /// were filled.
    pub async fn analyse_ledger(&self, ledger: &mut Ledger, now: NaiveDateTime) -> usize {
        let pending: Vec<(String, usize, Signal)> = ledger
            .iter()
            .flat_map(|(symbol, entry)| {
                entry
                    .signals
                    .iter()
                    .enumerate()
                    .filter(|(_, signal)| signal.needs_outcome(now))
                    .map(move |(idx, signal)| (symbol.clone(), idx, signal.clone()))
            })
            .collect();
        if pending.is_empty() {
            return 0;
        }
        info!("{} signal(s) need an outcome", pending.len());

        let collector = &self.collector;
        let outcomes: Vec<(String, usize, Option<Outcome>)> = stream::iter(pending)
            .map(|(symbol, idx, signal)| async move {
                let start = helpers::local_to_ms(&signal.open_time);
                let end = helpers::local_to_ms(&signal.after_close_time);
                let outcome = collector
                    .fetch_range(&symbol, signal.interval, start, end)
                    .await
                    .and_then(|candles| Outcome::from_candles(signal.open_price, &candles));
                (symbol, idx, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut filled = 0;
        for (symbol, idx, outcome) in outcomes {
            let Some(outcome) = outcome else {
                warn!("[{}] No candles for signal #{}", symbol, idx);
                continue;
            };
            if let Some(signal) = ledger
                .get_mut(&symbol)
                .and_then(|entry| entry.signals.get_mut(idx))
            {
                outcome.apply(signal, now);
                filled += 1;
            }
        }
        filled
    }

    /// Loads the ledger of `date`, fills pending outcomes and writes it back.
    pub async fn analyse_day(
        &self,
        recorder: &mut SignalRecorder,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<usize> {
        let mut ledger = recorder.load_day(date)?;
        let filled = self.analyse_ledger(&mut ledger, now).await;
        if filled > 0 {
            recorder.store_day(date, &ledger)?;
        }
        info!("Analysed {}: {} signal(s) updated", date, filled);
        Ok(filled)
    }
}
