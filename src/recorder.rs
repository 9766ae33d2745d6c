use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use log::{error, info};

use crate::config::RecorderConfig;
use crate::helpers::{Result, LEDGER_DATE_FORMAT};
use crate::models::{Interval, Ledger, PositionSide, Signal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSignalResult {
    pub accepted: bool,
    pub message: String,
}

impl AddSignalResult {
    fn accepted(message: String) -> Self {
        Self {
            accepted: true,
            message,
        }
    }

    fn rejected(message: String) -> Self {
        Self {
            accepted: false,
            message,
        }
    }
}

/// Per-day signal ledger. The live day sits in `data_dir/<date>.json` and is
/// rewritten in full on every accepted signal; closed days are moved under
/// the history directory.
pub struct SignalRecorder {
    config: RecorderConfig,
    history_dir: PathBuf,
    current_date: NaiveDate,
    ledger: Ledger,
    /// Previous-day signals still inside the duplicate window of the current
    /// day. Checked for duplicates, never written.
    carry_over: Vec<Signal>,
}

fn day_file(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.json", date.format(LEDGER_DATE_FORMAT)))
}

fn file_date(path: &Path) -> Option<NaiveDate> {
    if path.extension()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, LEDGER_DATE_FORMAT).ok()
}

fn read_ledger(path: &Path) -> Result<Ledger> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(ledger)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Rename, falling back to copy and delete only when the roots sit on
/// different filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        other => other,
    }
}

fn signals_since(ledger: &Ledger, cutoff: NaiveDateTime) -> Vec<Signal> {
    ledger
        .values()
        .flat_map(|entry| entry.signals.iter())
        .filter(|signal| signal.open_time >= cutoff)
        .cloned()
        .collect()
}

fn ledger_dates(dir: &Path) -> Result<Vec<NaiveDate>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut dates = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(date) = file_date(&entry?.path()) {
            dates.push(date);
        }
    }
    Ok(dates)
}

impl SignalRecorder {
    /// Opens the recorder for `today`, reloading that day's ledger when a
    /// previous run left one behind.
    pub fn open(config: RecorderConfig, today: NaiveDate) -> Result<Self> {
        let history_dir = config.history_dir();
        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(&history_dir)?;

        let path = day_file(&config.data_dir, today);
        let ledger = if path.exists() {
            match read_ledger(&path) {
                Ok(ledger) => ledger,
                Err(e) => {
                    error!("Failed to load ledger {}: {}", path.display(), e);
                    Ledger::new()
                }
            }
        } else {
            Ledger::new()
        };

        let window = TimeDelta::minutes(config.duplicate_window_minutes);
        let carry_over = today
            .pred_opt()
            .and_then(|yesterday| {
                [&config.data_dir, &history_dir]
                    .into_iter()
                    .map(|dir| day_file(dir, yesterday))
                    .find(|path| path.exists())
            })
            .and_then(|path| read_ledger(&path).ok())
            .map(|previous| signals_since(&previous, today.and_time(NaiveTime::MIN) - window))
            .unwrap_or_default();

        Ok(Self {
            config,
            history_dir,
            current_date: today,
            ledger,
            carry_over,
        })
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn current_file(&self) -> PathBuf {
        day_file(&self.config.data_dir, self.current_date)
    }

    pub fn save(&self) -> Result<()> {
        write_ledger(&self.current_file(), &self.ledger)
    }

    /// Flush the outgoing day, move its file into history and start empty.
    fn roll_over(&mut self, date: NaiveDate) {
        if !self.ledger.is_empty() {
            if let Err(e) = self.save() {
                error!("Failed to flush ledger for {}: {}", self.current_date, e);
            }
        }
        let outgoing = self.current_file();
        if outgoing.exists() {
            let target = day_file(&self.history_dir, self.current_date);
            match move_file(&outgoing, &target) {
                Ok(()) => info!("Archived ledger {}", target.display()),
                Err(e) => error!("Failed to archive {}: {}", outgoing.display(), e),
            }
        }
        let window = TimeDelta::minutes(self.config.duplicate_window_minutes);
        self.carry_over = signals_since(&self.ledger, date.and_time(NaiveTime::MIN) - window);
        self.current_date = date;
        self.ledger = Ledger::new();
    }

    fn duplicate_reason(
        &self,
        symbol: &str,
        side: PositionSide,
        open_price: f64,
        time: NaiveDateTime,
    ) -> Option<String> {
        let window = TimeDelta::minutes(self.config.duplicate_window_minutes);
        let carried = self.carry_over.iter().filter(|signal| signal.symbol == symbol);
        let today = self
            .ledger
            .get(symbol)
            .into_iter()
            .flat_map(|entry| entry.signals.iter());

        for signal in carried.chain(today).rev() {
            let gap = (time - signal.open_time).abs();
            if gap > window {
                continue;
            }
            if signal.open_price > 0.0 {
                let price_diff = (open_price - signal.open_price).abs() / signal.open_price;
                if price_diff < self.config.price_tolerance {
                    return Some(format!(
                        "Duplicate signal: {} {} price {} ({:.2}% from {} {} min ago)",
                        symbol,
                        side,
                        open_price,
                        price_diff * 100.0,
                        signal.open_price,
                        gap.num_minutes()
                    ));
                }
            }
            if self.config.reject_same_side_in_window && signal.position_side == side {
                return Some(format!(
                    "{} {} already signalled {} min ago",
                    symbol,
                    side,
                    gap.num_minutes()
                ));
            }
        }
        None
    }

    pub fn add_signal(
        &mut self,
        symbol: &str,
        interval: Interval,
        position_side: PositionSide,
        open_price: f64,
        time: NaiveDateTime,
        check_duplicate: bool,
    ) -> AddSignalResult {
        let date = time.date();
        if date > self.current_date {
            self.roll_over(date);
        }

        if check_duplicate {
            if let Some(reason) = self.duplicate_reason(symbol, position_side, open_price, time) {
                info!("[{}] {}", symbol, reason);
                return AddSignalResult::rejected(reason);
            }
        }

        let outcome_window =
            TimeDelta::milliseconds(interval.duration_ms() * self.config.outcome_candles as i64);
        let signal = Signal {
            symbol: symbol.to_string(),
            interval,
            position_side,
            open_time: time,
            open_price,
            after_close_time: time + outcome_window,
            after_high_price: None,
            after_low_price: None,
            rate_of_up_change: None,
            rate_of_down_change: None,
            update_time: None,
        };
        self.ledger
            .entry(symbol.to_string())
            .or_default()
            .signals
            .push(signal);

        if let Err(e) = self.save() {
            error!("[{}] Failed to persist ledger: {}", symbol, e);
        }

        let message = format!("Recorded signal: {} {} {} at {}", symbol, interval, position_side, open_price);
        info!("[{}] {}", symbol, message);
        AddSignalResult::accepted(message)
    }

    /// Moves every live-root ledger older than the retention window into
    /// history. Returns the number of files moved.
    pub fn archive_stale(&self, today: NaiveDate) -> Result<usize> {
        let cutoff = today - TimeDelta::days(self.config.retention_days);
        let mut moved = 0;
        for date in ledger_dates(&self.config.data_dir)? {
            if date >= cutoff || date == self.current_date {
                continue;
            }
            let from = day_file(&self.config.data_dir, date);
            let to = day_file(&self.history_dir, date);
            match move_file(&from, &to) {
                Ok(()) => {
                    moved += 1;
                    info!("Archived ledger {}", to.display());
                }
                Err(e) => error!("Failed to archive {}: {}", from.display(), e),
            }
        }
        info!("Archive sweep finished: {} file(s) moved", moved);
        Ok(moved)
    }

    /// Ledger for `date`, looked up in history first, then in the live root.
    pub fn load_day(&self, date: NaiveDate) -> Result<Ledger> {
        if date == self.current_date {
            return Ok(self.ledger.clone());
        }
        for dir in [&self.history_dir, &self.config.data_dir] {
            let path = day_file(dir, date);
            if path.exists() {
                return read_ledger(&path);
            }
        }
        Ok(Ledger::new())
    }

    /// Writes `ledger` back where `date` currently lives (history by default).
    pub fn store_day(&mut self, date: NaiveDate, ledger: &Ledger) -> Result<()> {
        if date == self.current_date {
            self.ledger = ledger.clone();
            return self.save();
        }
        let live = day_file(&self.config.data_dir, date);
        let path = if live.exists() {
            live
        } else {
            day_file(&self.history_dir, date)
        };
        write_ledger(&path, ledger)
    }

    /// Every day with a ledger other than the current one, newest first.
    pub fn history_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = ledger_dates(&self.history_dir)?;
        dates.extend(ledger_dates(&self.config.data_dir)?);
        dates.retain(|d| *d != self.current_date);
        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();
        Ok(dates)
    }

    /// Current-day signals from the last `hours`, optionally for one symbol.
    pub fn recent_signals(&self, symbol: Option<&str>, hours: i64, now: NaiveDateTime) -> Vec<Signal> {
        let cutoff = now - TimeDelta::hours(hours);
        self.ledger
            .iter()
            .filter(|(s, _)| symbol.map_or(true, |wanted| wanted == s.as_str()))
            .flat_map(|(_, entry)| entry.signals.iter())
            .filter(|signal| signal.open_time >= cutoff)
            .cloned()
            .collect()
    }

    /// Drops current-day signals older than `days`; symbols left without
    /// signals disappear from the ledger. Returns the number removed.
    pub fn clear_old_signals(&mut self, days: i64, now: NaiveDateTime) -> Result<usize> {
        let cutoff = now - TimeDelta::days(days);
        let mut removed = 0;
        for entry in self.ledger.values_mut() {
            let before = entry.signals.len();
            entry.signals.retain(|signal| signal.open_time >= cutoff);
            removed += before - entry.signals.len();
        }
        self.ledger.retain(|_, entry| !entry.signals.is_empty());
        if removed > 0 {
            info!("Cleared {} signal(s) older than {} day(s)", removed, days);
            self.save()?;
        }
        Ok(removed)
    }
}
