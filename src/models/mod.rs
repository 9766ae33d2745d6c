pub mod candle;
pub mod signal;

pub use candle::{Candle, Interval};
pub use signal::{Ledger, PositionSide, Signal, SymbolSignals, Vote};
