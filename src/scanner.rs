use std::collections::BTreeMap;
use std::io::{stdout, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use crossterm::cursor::MoveToColumn;
use crossterm::execute;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::collector::{FetchOutcome, KlineCollector};
use crate::config::{ScanConfig, ScannerConfig, ScheduleConfig};
use crate::detector::SignalDetector;
use crate::exchange::{KlineSource, TrafficStats};
use crate::external::{Alerter, KeyCommand, LogExecutor, SymbolExecutor, TerminalBell};
use crate::helpers::{self, Result};
use crate::manager::SignalManager;
use crate::models::{Candle, Interval, PositionSide, Vote};
use crate::recorder::SignalRecorder;

/// Minimum gap between two scheduled scans.
const MIN_SCAN_GAP_SECS: i64 = 57;

/// Wall-clock trigger for scan cycles.
#[derive(Debug, Clone)]
pub struct ScanSchedule {
    config: ScheduleConfig,
}

impl ScanSchedule {
    pub fn new(config: ScheduleConfig) -> Self {
        Self { config }
    }

    pub fn is_debug(&self) -> bool {
        self.config.debug
    }

    fn allows(&self, hour: u32, minute: u32) -> bool {
        let hour_ok = self
            .config
            .hours
            .as_ref()
            .map_or(true, |hours| hours.contains(&hour));
        hour_ok && self.config.minutes.contains(&minute)
    }

    pub fn should_scan(&self, now: NaiveDateTime, last_scan: Option<NaiveDateTime>) -> bool {
        if self.config.debug {
            return true;
        }
        if !self.allows(now.hour(), now.minute()) {
            return false;
        }
        if let Some(last) = last_scan {
            let same_minute = last.date() == now.date()
                && last.hour() == now.hour()
                && last.minute() == now.minute();
            if same_minute || now - last < TimeDelta::seconds(MIN_SCAN_GAP_SECS) {
                return false;
            }
        }
        self.config.seconds.is_empty() || self.config.seconds.contains(&now.second())
    }

    pub fn next_scan_time(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.config.debug {
            return Some(now);
        }
        let second = self.config.seconds.iter().min().copied().unwrap_or(0);
        let base = now.with_second(0)?.with_nanosecond(0)?;
        (0..48 * 60)
            .map(|step| base + TimeDelta::minutes(step) + TimeDelta::seconds(second as i64))
            .find(|candidate| *candidate > now && self.allows(candidate.hour(), candidate.minute()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanInput {
    Triggered,
    Completed,
}

/// Summary of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub actionable: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub traffic: TrafficStats,
}

/// Redraws a single terminal line, only when its text changes.
#[derive(Debug, Default)]
pub struct StatusLine {
    last: String,
}

impl StatusLine {
    pub fn draw(&mut self, text: String) {
        if text == self.last {
            return;
        }
        let mut out = stdout();
        if let Err(e) = execute!(out, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(&text)) {
            debug!("Failed to draw status line: {}", e);
        }
        if let Err(e) = out.flush() {
            debug!("Failed to flush status line: {}", e);
        }
        self.last = text;
    }
}

pub struct ScanOrchestrator<S: KlineSource + ?Sized> {
    config: ScanConfig,
    schedule: ScanSchedule,
    max_retries: u32,
    collector: Arc<KlineCollector<S>>,
    detector: SignalDetector,
    recorder: Arc<Mutex<SignalRecorder>>,
    manager: Arc<SignalManager>,
    executor: Arc<dyn SymbolExecutor>,
    alerter: Arc<dyn Alerter>,
    state: ScanState,
    last_scan: Option<NaiveDateTime>,
    primed: bool,
    status: StatusLine,
}

impl<S: KlineSource + ?Sized> ScanOrchestrator<S> {
    pub fn new(
        config: &ScannerConfig,
        collector: Arc<KlineCollector<S>>,
        recorder: Arc<Mutex<SignalRecorder>>,
        manager: Arc<SignalManager>,
    ) -> Self {
        Self {
            config: config.scan.clone(),
            schedule: ScanSchedule::new(config.schedule.clone()),
            max_retries: config.collector.max_retries,
            collector,
            detector: SignalDetector::new(config.detector.clone()),
            recorder,
            manager,
            executor: Arc::new(LogExecutor),
            alerter: Arc::new(TerminalBell),
            state: ScanState::Idle,
            last_scan: None,
            primed: false,
            status: StatusLine::default(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn SymbolExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn last_scan(&self) -> Option<NaiveDateTime> {
        self.last_scan
    }

    pub fn process_input(&mut self, input: ScanInput) {
        let old_state = self.state;
        self.state = match (old_state, input) {
            (ScanState::Idle, ScanInput::Triggered) => ScanState::Scanning,
            (ScanState::Scanning, ScanInput::Completed) => ScanState::Idle,
            _ => {
                debug!("No scan transition for {:?} in state {:?}", input, old_state);
                old_state
            }
        };
        if old_state != self.state {
            debug!("Scan state transition: {:?} -> {:?}", old_state, self.state);
        }
    }

    fn now(&self) -> NaiveDateTime {
        helpers::ms_to_local(self.collector.now_ms())
    }

    /// Intervals coarsest first, duplicates removed.
    fn ordered_intervals(&self) -> Vec<Interval> {
        let mut intervals = self.config.intervals.clone();
        intervals.sort_by_key(|i| std::cmp::Reverse(i.duration_ms()));
        intervals.dedup();
        intervals
    }

    async fn fetch_interval(&self, interval: Interval, use_cache: bool) -> Vec<(String, FetchOutcome)> {
        let limit = self
            .collector
            .config()
            .limit
            .max(self.detector.required_len(interval));
        let batch_size = self.config.batch_size.max(1);
        let batches = self.config.symbols.chunks(batch_size).count();
        let mut results = Vec::with_capacity(self.config.symbols.len());

        for (n, batch) in self.config.symbols.chunks(batch_size).enumerate() {
            let collector = &self.collector;
            let max_retries = self.max_retries;
            let fetched: Vec<(String, FetchOutcome)> = stream::iter(batch)
                .map(|symbol| async move {
                    let outcome = collector
                        .fetch(symbol, interval, limit, max_retries, use_cache)
                        .await;
                    (symbol.clone(), outcome)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
            results.extend(fetched);

            if n + 1 < batches {
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }
        }
        results
    }

    /// Fetches every configured interval, votes, and records symbols on
    /// which all intervals agree.
    pub async fn scan_cycle(&mut self, now: NaiveDateTime) -> CycleReport {
        let intervals = self.ordered_intervals();
        let traffic_before = self.collector.traffic();
        let use_cache = self.primed;

        let mut votes: BTreeMap<String, i32> = BTreeMap::new();
        let mut entry_price: BTreeMap<String, f64> = BTreeMap::new();
        let mut succeeded = 0;
        let mut failed = 0;

        for &interval in &intervals {
            let mut fetched = self.fetch_interval(interval, use_cache).await;
            fetched.sort_by(|a, b| a.0.cmp(&b.0));

            for (symbol, outcome) in fetched {
                let series: Vec<Candle> = match outcome {
                    FetchOutcome::Exhausted(reason) => {
                        warn!("[{} {}] Skipped this cycle: {}", symbol, interval, reason);
                        failed += 1;
                        continue;
                    }
                    other => match other.into_series(self.config.use_delayed_data) {
                        Some(series) => series,
                        None => {
                            warn!("[{} {}] Skipped delayed data", symbol, interval);
                            failed += 1;
                            continue;
                        }
                    },
                };
                succeeded += 1;

                let vote = self.detector.detect(interval, &series);
                debug!("[{} {}] Vote {:?}", symbol, interval, vote);
                if let Some(last) = series.last() {
                    entry_price.insert(symbol.clone(), last.open);
                }
                *votes.entry(symbol).or_default() += vote.weight();
            }
        }

        let required = intervals.len() as i32;
        let mut signals: Vec<(String, PositionSide, f64)> = Vec::new();
        for (symbol, count) in votes {
            if required == 0 || count.abs() != required {
                continue;
            }
            if !helpers::is_tradeable_symbol(&symbol) {
                debug!("[{}] Dropped non-ASCII symbol", symbol);
                continue;
            }
            let Some(side) = Vote::from_weight(count).side() else {
                continue;
            };
            let price = entry_price.get(&symbol).copied().unwrap_or_default();
            signals.push((symbol, side, price));
        }

        if let Some(&finest) = intervals.last() {
            self.record(signals.clone(), finest, now).await;
        }

        let traffic_after = self.collector.traffic();
        let traffic = TrafficStats {
            requests: traffic_after.requests.saturating_sub(traffic_before.requests),
            bytes: traffic_after.bytes.saturating_sub(traffic_before.bytes),
        };
        info!(
            "Cycle done: {} fetched, {} failed, {} signal(s), {} requests, {} bytes",
            succeeded,
            failed,
            signals.len(),
            traffic.requests,
            traffic.bytes
        );

        if succeeded > 0 {
            self.primed = true;
        }
        CycleReport {
            actionable: signals.into_iter().map(|(symbol, _, _)| symbol).collect(),
            succeeded,
            failed,
            traffic,
        }
    }

    async fn record(&self, signals: Vec<(String, PositionSide, f64)>, interval: Interval, now: NaiveDateTime) {
        if signals.is_empty() {
            return;
        }
        let recorder = self.recorder.clone();
        let recorded = tokio::task::spawn_blocking(move || {
            let mut recorder = recorder.lock();
            for (symbol, side, price) in signals {
                let result = recorder.add_signal(&symbol, interval, side, price, now, true);
                debug!("[{}] {}", symbol, result.message);
            }
        })
        .await;
        if let Err(e) = recorded {
            error!("Signal recording task failed: {}", e);
        }
    }

    pub async fn perform_scan(&mut self, now: NaiveDateTime) -> CycleReport {
        self.process_input(ScanInput::Triggered);
        info!("Scan started {}", now.format("%H:%M:%S"));

        let report = self.scan_cycle(now).await;
        if report.actionable.is_empty() {
            info!("No signals");
        } else {
            info!("Signals found: {}", report.actionable.join(" | "));
            self.alerter.alert(&report.actionable);
        }
        self.manager.update(report.actionable.clone());
        self.last_scan = Some(now);

        self.process_input(ScanInput::Completed);
        report
    }

    /// Applies one key command. Returns false when the loop should stop.
    pub async fn handle_key(&mut self, command: KeyCommand) -> bool {
        let step = match command {
            KeyCommand::Quit => return false,
            KeyCommand::Next => self.manager.execute_and_move_next(),
            KeyCommand::Previous => self.manager.execute_and_move_previous(),
        };
        if !self.manager.has_signals() {
            warn!("No signals to execute");
            return true;
        }
        let Some(step) = step else {
            debug!("Cursor already at the boundary");
            return true;
        };

        let executor = self.executor.clone();
        let symbol = step.executed.clone();
        match tokio::task::spawn_blocking(move || executor.execute(&symbol)).await {
            Ok(Ok(())) => match &step.neighbor {
                Some(neighbor) => info!("[{}] Executed, next up: {}", step.executed, neighbor),
                None => info!("[{}] Executed, end of list", step.executed),
            },
            Ok(Err(e)) => error!("[{}] Execution failed: {}", step.executed, e),
            Err(e) => error!("[{}] Execution task failed: {}", step.executed, e),
        }
        true
    }

    pub fn status_text(&self, now: NaiveDateTime) -> String {
        let clock = now.format("%H:%M:%S");
        if self.state == ScanState::Scanning {
            return format!("🔍 [{}] Scanning...", clock);
        }
        let countdown = match self.schedule.next_scan_time(now) {
            Some(next) if next > now => {
                let secs = (next - now).num_seconds();
                format!("next scan in {:02}:{:02}", secs / 60, secs % 60)
            }
            _ => "scanning soon...".to_string(),
        };
        match self.manager.current_symbol() {
            Some(symbol) => {
                let mark = if self.manager.is_current_executed() {
                    "✅"
                } else {
                    "⏳"
                };
                format!(
                    "{} [{}] Current: {} {} | {}",
                    mark,
                    clock,
                    symbol,
                    self.manager.position_info(),
                    countdown
                )
            }
            None => format!("📊 [{}] {} | {}", clock, self.manager.position_info(), countdown),
        }
    }

    /// Main loop: drain key commands, scan when the schedule fires, redraw
    /// the status line, sleep one tick.
    pub async fn run(&mut self, mut keys: UnboundedReceiver<KeyCommand>) -> Result<()> {
        info!(
            "Scanner started: {} symbol(s), intervals {:?}",
            self.config.symbols.len(),
            self.ordered_intervals()
        );
        let tick = Duration::from_millis(self.config.tick_ms.max(1));

        loop {
            while let Ok(command) = keys.try_recv() {
                if !self.handle_key(command).await {
                    info!("Scanner stopped");
                    return Ok(());
                }
            }

            let now = self.now();
            if self.state == ScanState::Idle && self.schedule.should_scan(now, self.last_scan) {
                self.perform_scan(now).await;
            }

            let text = self.status_text(self.now());
            self.status.draw(text);
            tokio::time::sleep(tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, RecorderConfig};
    use crate::exchange::KlineSimulator;
    use crate::services::KlineCache;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    const START: i64 = 1_735_689_600_000 + 62_000;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_schedule_minutes_and_seconds() {
        let schedule = ScanSchedule::new(ScheduleConfig::default());
        assert!(schedule.should_scan(at(10, 15, 2), None));
        assert!(schedule.should_scan(at(10, 45, 3), None));
        assert!(!schedule.should_scan(at(10, 15, 4), None));
        assert!(!schedule.should_scan(at(10, 16, 2), None));

        let last = Some(at(10, 15, 2));
        assert!(!schedule.should_scan(at(10, 15, 3), last));
        assert!(schedule.should_scan(at(10, 30, 2), last));
    }

    #[test]
    fn test_schedule_hours_and_debug() {
        let schedule = ScanSchedule::new(ScheduleConfig {
            hours: Some(vec![9, 10]),
            ..ScheduleConfig::default()
        });
        assert!(schedule.should_scan(at(9, 0, 2), None));
        assert!(!schedule.should_scan(at(11, 0, 2), None));

        let debug = ScanSchedule::new(ScheduleConfig {
            debug: true,
            ..ScheduleConfig::default()
        });
        assert!(debug.should_scan(at(11, 7, 41), Some(at(11, 7, 40))));
        assert_eq!(debug.next_scan_time(at(11, 7, 41)), Some(at(11, 7, 41)));
    }

    #[test]
    fn test_next_scan_time() {
        let schedule = ScanSchedule::new(ScheduleConfig::default());
        assert_eq!(schedule.next_scan_time(at(10, 7, 30)), Some(at(10, 15, 2)));
        assert_eq!(schedule.next_scan_time(at(10, 15, 1)), Some(at(10, 15, 2)));
        assert_eq!(schedule.next_scan_time(at(10, 15, 2)), Some(at(10, 30, 2)));
        assert_eq!(schedule.next_scan_time(at(23, 50, 0)), Some(at(0, 0, 2) + TimeDelta::days(1)));

        let restricted = ScanSchedule::new(ScheduleConfig {
            hours: Some(vec![12]),
            ..ScheduleConfig::default()
        });
        assert_eq!(restricted.next_scan_time(at(10, 7, 30)), Some(at(12, 0, 2)));
    }

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl SymbolExecutor for RecordingExecutor {
        fn execute(&self, symbol: &str) -> Result<()> {
            self.calls.lock().push(symbol.to_string());
            Ok(())
        }
    }

    struct SilentAlerter;

    impl Alerter for SilentAlerter {
        fn alert(&self, _symbols: &[String]) {}
    }

    /// Closed bodies followed by an in-progress candle ending at `now`.
    fn scripted(interval: Interval, bodies: &[(f64, f64)]) -> Vec<Candle> {
        let step = interval.duration_ms();
        let newest = interval.align(START);
        let mut all = bodies.to_vec();
        all.push((bodies[bodies.len() - 1].1, bodies[bodies.len() - 1].1));
        let first = newest - (all.len() as i64 - 1) * step;
        all.iter()
            .enumerate()
            .map(|(i, (open, close))| {
                let open_time = first + i as i64 * step;
                Candle {
                    open_time,
                    open: *open,
                    high: open.max(*close),
                    low: open.min(*close),
                    close: *close,
                    volume: 1.0,
                    close_time: open_time + step - 1,
                }
            })
            .collect()
    }

    const LONG: [(f64, f64); 3] = [(100.0, 105.0), (105.0, 100.0), (98.0, 104.0)];
    const SHORT: [(f64, f64); 3] = [(100.0, 95.0), (95.0, 100.0), (101.0, 94.0)];

    struct Harness {
        _dir: TempDir,
        sim: Arc<KlineSimulator>,
        manager: Arc<SignalManager>,
        recorder: Arc<Mutex<SignalRecorder>>,
        executor: Arc<RecordingExecutor>,
        orchestrator: ScanOrchestrator<KlineSimulator>,
    }

    fn harness(symbols: &[&str]) -> Harness {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(KlineSimulator::new(21, START).unwrap());

        let mut config = ScannerConfig::default();
        config.scan.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config.scan.intervals = vec![Interval::M15, Interval::H1];
        config.scan.batch_size = 2;
        config.scan.batch_pause_ms = 0;
        config.collector.retry_delay_ms = 0;
        config.collector.delay_retry_pause_ms = 0;
        config.collector.max_retries = 2;
        config.collector.limit = 30;
        let reversal = config.detector.rules[&Interval::M15];
        config.detector = DetectorConfig {
            default_rule: reversal,
            ..DetectorConfig::default()
        };
        config.detector.rules.insert(Interval::H1, reversal);
        config.schedule.debug = true;

        let cache = Arc::new(Mutex::new(KlineCache::in_memory()));
        let collector = Arc::new(KlineCollector::new(sim.clone(), cache, config.collector.clone()));
        let recorder_config = RecorderConfig {
            data_dir: dir.path().to_path_buf(),
            ..RecorderConfig::default()
        };
        let today = helpers::ms_to_local(START).date();
        let recorder = Arc::new(Mutex::new(SignalRecorder::open(recorder_config, today).unwrap()));
        let manager = Arc::new(SignalManager::new());
        let executor = Arc::new(RecordingExecutor {
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = ScanOrchestrator::new(&config, collector, recorder.clone(), manager.clone())
            .with_executor(executor.clone())
            .with_alerter(Arc::new(SilentAlerter));

        Harness {
            _dir: dir,
            sim,
            manager,
            recorder,
            executor,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_all_intervals_must_agree() {
        let mut h = harness(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        for interval in [Interval::M15, Interval::H1] {
            h.sim.script("AUSDT", interval, scripted(interval, &LONG));
            h.sim.script("DUSDT", interval, scripted(interval, &SHORT));
            h.sim.script("CUSDT", interval, Vec::new());
        }
        h.sim.script("BUSDT", Interval::M15, scripted(Interval::M15, &LONG));
        h.sim.script("BUSDT", Interval::H1, scripted(Interval::H1, &SHORT));

        let now = helpers::ms_to_local(START);
        let report = h.orchestrator.perform_scan(now).await;

        assert_eq!(report.actionable, vec!["AUSDT".to_string(), "DUSDT".to_string()]);
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 2);
        assert!(report.traffic.requests >= 8);
        assert_eq!(h.manager.symbols(), report.actionable);
        assert_eq!(h.orchestrator.state(), ScanState::Idle);
        assert_eq!(h.orchestrator.last_scan(), Some(now));

        let recorder = h.recorder.lock();
        let a = &recorder.ledger()["AUSDT"].signals[0];
        assert_eq!(a.position_side, PositionSide::Long);
        assert_eq!(a.interval, Interval::M15);
        assert_eq!(a.open_price, 104.0);
        assert_eq!(recorder.ledger()["DUSDT"].signals[0].position_side, PositionSide::Short);
        assert!(!recorder.ledger().contains_key("BUSDT"));
    }

    #[tokio::test]
    async fn test_second_cycle_is_incremental() {
        let mut h = harness(&["AUSDT"]);
        let now = helpers::ms_to_local(START);
        h.orchestrator.perform_scan(now).await;
        h.orchestrator.perform_scan(now + TimeDelta::minutes(1)).await;

        let last = h.sim.last_request().unwrap();
        assert_eq!(last.limit, 5);
    }

    #[tokio::test]
    async fn test_keys_drive_executor() {
        let mut h = harness(&["AUSDT", "DUSDT"]);
        for interval in [Interval::M15, Interval::H1] {
            h.sim.script("AUSDT", interval, scripted(interval, &LONG));
            h.sim.script("DUSDT", interval, scripted(interval, &LONG));
        }
        h.orchestrator.perform_scan(helpers::ms_to_local(START)).await;

        assert!(h.orchestrator.handle_key(KeyCommand::Next).await);
        assert!(h.orchestrator.handle_key(KeyCommand::Next).await);
        assert!(h.orchestrator.handle_key(KeyCommand::Next).await);
        assert!(h.orchestrator.handle_key(KeyCommand::Previous).await);
        assert!(!h.orchestrator.handle_key(KeyCommand::Quit).await);

        assert_eq!(*h.executor.calls.lock(), vec!["AUSDT", "DUSDT", "AUSDT"]);
        assert_eq!(h.manager.current_symbol().as_deref(), Some("AUSDT"));
        let status = h.orchestrator.status_text(helpers::ms_to_local(START));
        assert!(status.contains("Current: AUSDT [1/2]✅"));
    }

    #[tokio::test]
    async fn test_run_stops_on_quit() {
        let mut h = harness(&["AUSDT"]);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(KeyCommand::Quit).unwrap();
        h.orchestrator.run(rx).await.unwrap();
        assert_eq!(h.orchestrator.last_scan(), None);
    }

    #[test]
    fn test_state_machine() {
        let h = harness(&["AUSDT"]);
        let mut orchestrator = h.orchestrator;
        orchestrator.process_input(ScanInput::Completed);
        assert_eq!(orchestrator.state(), ScanState::Idle);
        orchestrator.process_input(ScanInput::Triggered);
        assert_eq!(orchestrator.state(), ScanState::Scanning);
        orchestrator.process_input(ScanInput::Triggered);
        assert_eq!(orchestrator.state(), ScanState::Scanning);
        assert!(orchestrator.status_text(at(1, 2, 3)).contains("Scanning"));
        orchestrator.process_input(ScanInput::Completed);
        assert_eq!(orchestrator.state(), ScanState::Idle);
    }
}
