use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use klinescan::{
    analysis::SignalAnalyzer,
    cli::{Args, Command},
    collector::KlineCollector,
    config::ScannerConfig,
    exchange::{ExchangeConnector, KlineSimulator, KlineSource},
    external::spawn_keyboard_listener,
    helpers,
    manager::SignalManager,
    recorder::SignalRecorder,
    scanner::ScanOrchestrator,
    services::KlineCache,
};

type Collector = KlineCollector<dyn KlineSource>;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ScannerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ScannerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(3)
        .build()?;
    runtime.block_on(start(args, config))
}

async fn start(args: Args, config: ScannerConfig) -> anyhow::Result<()> {
    let source: Arc<dyn KlineSource> = if args.simulate {
        info!("Using offline kline simulator");
        Arc::new(KlineSimulator::live(rand::random())?)
    } else {
        Arc::new(ExchangeConnector::new(config.exchange.clone())?)
    };
    let cache = Arc::new(Mutex::new(KlineCache::new(&config.cache)));
    let collector: Arc<Collector> =
        Arc::new(KlineCollector::new(source, cache, config.collector.clone()));

    let today = helpers::local_now().date();
    let recorder = SignalRecorder::open(config.recorder.clone(), today)?;

    match args.command() {
        Command::Run => run(&config, collector, recorder).await,
        Command::Archive => {
            let moved = recorder.archive_stale(today)?;
            info!("Archived {} ledger file(s)", moved);
            Ok(())
        }
        Command::Analyse { date } => analyse(&config, collector, recorder, date).await,
    }
}

async fn run(
    config: &ScannerConfig,
    collector: Arc<Collector>,
    recorder: SignalRecorder,
) -> anyhow::Result<()> {
    if let Err(e) = recorder.archive_stale(helpers::local_now().date()) {
        warn!("Retention sweep failed: {}", e);
    }
    let recorder = Arc::new(Mutex::new(recorder));
    let manager = Arc::new(SignalManager::new());

    let (tx, rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let listener = spawn_keyboard_listener(tx, stop.clone())
        .context("Failed to start keyboard listener")?;

    let mut orchestrator = ScanOrchestrator::new(config, collector, recorder.clone(), manager);
    let result = orchestrator.run(rx).await;

    stop.store(true, Ordering::Relaxed);
    if listener.join().is_err() {
        warn!("Keyboard listener panicked");
    }
    recorder.lock().save()?;
    result.map_err(Into::into)
}

async fn analyse(
    config: &ScannerConfig,
    collector: Arc<Collector>,
    mut recorder: SignalRecorder,
    date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let analyzer = SignalAnalyzer::new(collector, config.scan.concurrency);
    let now = helpers::local_now();
    let dates = match date {
        Some(date) => vec![date],
        None => {
            let mut dates = vec![recorder.current_date()];
            dates.extend(recorder.history_dates()?);
            dates
        }
    };
    let mut total = 0;
    for date in dates {
        total += analyzer.analyse_day(&mut recorder, date, now).await?;
    }
    info!("Outcome pass finished: {} signal(s) updated", total);
    Ok(())
}
