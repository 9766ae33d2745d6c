//! Boundaries to the outside world: whatever acts on a selected symbol, the
//! alert raised when a cycle produces signals, and the keyboard thread that
//! drives the cursor.

use std::io::{stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::{execute, style::Print};
use log::{debug, error, info};
use tokio::sync::mpsc::UnboundedSender;

use crate::helpers::Result;

/// Acts on the symbol the cursor just landed on. Implementations may block
/// (desktop automation), so callers run them on the blocking pool.
pub trait SymbolExecutor: Send + Sync {
    fn execute(&self, symbol: &str) -> Result<()>;
}

/// Executor that only logs; used when no automation backend is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExecutor;

impl SymbolExecutor for LogExecutor {
    fn execute(&self, symbol: &str) -> Result<()> {
        info!("[{}] Selected", symbol);
        Ok(())
    }
}

pub trait Alerter: Send + Sync {
    fn alert(&self, symbols: &[String]);
}

/// Rings the terminal bell once per cycle with new signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Alerter for TerminalBell {
    fn alert(&self, symbols: &[String]) {
        if symbols.is_empty() {
            return;
        }
        let mut out = stdout();
        if let Err(e) = execute!(out, Print('\u{7}')) {
            debug!("Failed to ring terminal bell: {}", e);
        }
        if let Err(e) = out.flush() {
            debug!("Failed to flush terminal bell: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Next,
    Previous,
    Quit,
}

impl KeyCommand {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' | '=' => Some(KeyCommand::Next),
            '-' | '_' => Some(KeyCommand::Previous),
            'q' | 'Q' => Some(KeyCommand::Quit),
            _ => None,
        }
    }
}

/// Spawns the OS thread reading key events. It exits when `stop` is set or
/// the receiving side of `tx` is dropped.
pub fn spawn_keyboard_listener(
    tx: UnboundedSender<KeyCommand>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("keyboard".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match event::poll(Duration::from_millis(200)) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        error!("Keyboard listener stopped: {}", e);
                        break;
                    }
                }
                let command = match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                        KeyCode::Char(c) => KeyCommand::from_char(c),
                        KeyCode::Esc => Some(KeyCommand::Quit),
                        _ => None,
                    },
                    Ok(_) => None,
                    Err(e) => {
                        error!("Keyboard listener stopped: {}", e);
                        break;
                    }
                };
                if let Some(command) = command {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
            }
            debug!("Keyboard listener exited");
        })
}
