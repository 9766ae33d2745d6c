use std::collections::HashSet;

use log::info;
use parking_lot::Mutex;

/// Result of one cursor step. `neighbor` is the symbol the next step in the
/// same direction would execute, `None` at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    pub executed: String,
    pub neighbor: Option<String>,
    pub moved: bool,
}

#[derive(Debug, Default)]
struct Cursor {
    symbols: Vec<String>,
    /// -1 until the first step.
    index: isize,
    executed: HashSet<String>,
}

impl Cursor {
    fn current(&self) -> Option<&String> {
        usize::try_from(self.index)
            .ok()
            .and_then(|i| self.symbols.get(i))
    }

    fn step_to(&mut self, index: isize, neighbor: isize) -> MoveResult {
        self.index = index;
        let executed = self.symbols[index as usize].clone();
        self.executed.insert(executed.clone());
        let neighbor = usize::try_from(neighbor)
            .ok()
            .and_then(|i| self.symbols.get(i))
            .cloned();
        MoveResult {
            executed,
            neighbor,
            moved: true,
        }
    }
}

/// Ordered list of the current cycle's actionable symbols with a cursor the
/// executor steps through. Replaced wholesale by the scan loop; every
/// operation runs under one lock.
#[derive(Debug)]
pub struct SignalManager {
    cursor: Mutex<Cursor>,
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalManager {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(Cursor {
                index: -1,
                ..Cursor::default()
            }),
        }
    }

    pub fn update(&self, symbols: Vec<String>) {
        let mut cursor = self.cursor.lock();
        info!("Signal list updated: {} ({} total)", symbols.join(", "), symbols.len());
        cursor.symbols = symbols;
        cursor.index = -1;
        cursor.executed.clear();
    }

    pub fn execute_and_move_next(&self) -> Option<MoveResult> {
        let mut cursor = self.cursor.lock();
        let last = cursor.symbols.len() as isize - 1;
        if cursor.index >= last {
            return None;
        }
        let index = cursor.index + 1;
        Some(cursor.step_to(index, index + 1))
    }

    pub fn execute_and_move_previous(&self) -> Option<MoveResult> {
        let mut cursor = self.cursor.lock();
        if cursor.symbols.is_empty() || cursor.index <= 0 {
            return None;
        }
        let index = cursor.index - 1;
        Some(cursor.step_to(index, index - 1))
    }

    pub fn current_symbol(&self) -> Option<String> {
        self.cursor.lock().current().cloned()
    }

    pub fn current_index(&self) -> isize {
        self.cursor.lock().index
    }

    pub fn position_info(&self) -> String {
        let cursor = self.cursor.lock();
        let total = cursor.symbols.len();
        if total == 0 {
            return "No signals".to_string();
        }
        match cursor.current() {
            None => format!("[ready/{}]", total),
            Some(symbol) => {
                let mark = if cursor.executed.contains(symbol) {
                    "✅"
                } else {
                    "⏳"
                };
                format!("[{}/{}]{}", cursor.index + 1, total, mark)
            }
        }
    }

    pub fn is_current_executed(&self) -> bool {
        let cursor = self.cursor.lock();
        cursor
            .current()
            .map_or(false, |symbol| cursor.executed.contains(symbol))
    }

    pub fn has_signals(&self) -> bool {
        !self.cursor.lock().symbols.is_empty()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.cursor.lock().symbols.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn manager(symbols: &[&str]) -> SignalManager {
        let m = SignalManager::new();
        m.update(symbols.iter().map(|s| s.to_string()).collect());
        m
    }

    #[test]
    fn test_empty_manager() {
        let m = SignalManager::new();
        assert!(!m.has_signals());
        assert_eq!(m.execute_and_move_next(), None);
        assert_eq!(m.execute_and_move_previous(), None);
        assert_eq!(m.current_symbol(), None);
        assert_eq!(m.position_info(), "No signals");
        assert!(!m.is_current_executed());
    }

    #[test]
    fn test_walk_forward_and_back() {
        let m = manager(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        assert_eq!(m.position_info(), "[ready/3]");
        assert_eq!(m.current_symbol(), None);

        let step = m.execute_and_move_next().unwrap();
        assert_eq!(step.executed, "BTCUSDT");
        assert_eq!(step.neighbor.as_deref(), Some("ETHUSDT"));
        assert!(m.is_current_executed());
        assert_eq!(m.position_info(), "[1/3]✅");

        m.execute_and_move_next();
        let last = m.execute_and_move_next().unwrap();
        assert_eq!(last.executed, "SOLUSDT");
        assert_eq!(last.neighbor, None);
        assert_eq!(m.execute_and_move_next(), None);
        assert_eq!(m.current_index(), 2);

        let back = m.execute_and_move_previous().unwrap();
        assert_eq!(back.executed, "ETHUSDT");
        assert_eq!(back.neighbor.as_deref(), Some("BTCUSDT"));
        let first = m.execute_and_move_previous().unwrap();
        assert_eq!(first.neighbor, None);
        assert_eq!(m.execute_and_move_previous(), None);
        assert_eq!(m.current_symbol().as_deref(), Some("BTCUSDT"));
    }

    #[test]
    fn test_previous_before_start_is_noop() {
        let m = manager(&["BTCUSDT"]);
        assert_eq!(m.execute_and_move_previous(), None);
        assert_eq!(m.current_index(), -1);
    }

    #[test]
    fn test_update_resets_cursor() {
        let m = manager(&["BTCUSDT", "ETHUSDT"]);
        m.execute_and_move_next();
        m.update(vec!["XRPUSDT".to_string()]);
        assert_eq!(m.current_index(), -1);
        assert!(!m.is_current_executed());
        assert_eq!(m.symbols(), vec!["XRPUSDT".to_string()]);
    }

    #[test]
    fn test_shared_between_threads() {
        let m = Arc::new(manager(&["A", "B", "C", "D"]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || m.execute_and_move_next())
            })
            .collect();
        let mut executed: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .map(|r| r.executed)
            .collect();
        executed.sort();
        assert_eq!(executed, vec!["A", "B", "C", "D"]);
    }

    proptest! {
        #[test]
        fn prop_cursor_stays_in_bounds(len in 0usize..6, steps in prop::collection::vec(any::<bool>(), 0..40)) {
            let symbols: Vec<String> = (0..len).map(|i| format!("S{i}USDT")).collect();
            let m = SignalManager::new();
            m.update(symbols);
            for forward in steps {
                let before = m.current_index();
                let result = if forward {
                    m.execute_and_move_next()
                } else {
                    m.execute_and_move_previous()
                };
                let after = m.current_index();
                prop_assert!(after >= -1 && after <= len as isize - 1);
                if result.is_none() {
                    prop_assert_eq!(before, after);
                } else {
                    prop_assert_eq!((after - before).abs(), 1);
                }
            }
        }
    }
}
