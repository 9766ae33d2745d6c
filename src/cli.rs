use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::config::ScannerConfig;
use crate::helpers::LEDGER_DATE_FORMAT;
use crate::models::Interval;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file; every field is optional.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Scan on every tick instead of on the configured schedule.
    #[arg(long)]
    pub debug: bool,

    /// Use the offline kline simulator instead of the exchange.
    #[arg(long)]
    pub simulate: bool,

    /// Comma separated symbols, e.g. BTCUSDT,ETHUSDT
    #[arg(long, value_delimiter = ',')]
    pub symbols: Option<Vec<String>>,

    /// Comma separated intervals, e.g. 1h,15m
    #[arg(long, value_delimiter = ',', value_parser = parse_interval)]
    pub intervals: Option<Vec<Interval>>,

    /// Root of the signal ledgers.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scan loop (default).
    Run,
    /// Move ledgers older than the retention window into history.
    Archive,
    /// Fill post-signal outcomes for one day's ledger.
    Analyse {
        /// Day to analyse, defaults to today.
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
}

pub fn parse_interval(s: &str) -> Result<Interval, String> {
    s.trim().parse::<Interval>().map_err(|e| e.to_string())
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, LEDGER_DATE_FORMAT)
        .map_err(|e| format!("Invalid date '{}': {}. Use YYYY-MM-DD.", s, e))
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Applies command line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut ScannerConfig) {
        if self.debug {
            config.schedule.debug = true;
        }
        if let Some(symbols) = &self.symbols {
            config.scan.symbols = symbols
                .iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(intervals) = &self.intervals {
            config.scan.intervals = intervals.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.recorder.data_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "klinescan",
            "--debug",
            "--symbols",
            "btcusdt, ethusdt",
            "--intervals",
            "1h,5m",
            "--data-dir",
            "/tmp/ledgers",
        ]);
        let mut config = ScannerConfig::default();
        args.apply(&mut config);

        assert!(config.schedule.debug);
        assert_eq!(config.scan.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.scan.intervals, vec![Interval::H1, Interval::M5]);
        assert_eq!(config.recorder.data_dir, PathBuf::from("/tmp/ledgers"));
        assert!(matches!(args.command(), Command::Run));
    }

    #[test]
    fn test_subcommands() {
        let args = Args::parse_from(["klinescan", "analyse", "--date", "2025-03-01"]);
        match args.command() {
            Command::Analyse { date } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 1));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(
            Args::parse_from(["klinescan", "archive"]).command(),
            Command::Archive
        ));
        assert!(Args::try_parse_from(["klinescan", "--intervals", "7m"]).is_err());
        assert!(Args::try_parse_from(["klinescan", "analyse", "--date", "01/03/2025"]).is_err());
    }
}
