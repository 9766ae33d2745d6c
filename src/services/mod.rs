pub mod kline_cache;

pub use kline_cache::{merge, merge_slow, DiskTier, KlineCache};
