pub mod analysis;
pub mod cli;
pub mod collector;
pub mod config;
pub mod detector;
pub mod errors;
pub mod exchange;
pub mod external;
pub mod helpers;
pub mod manager;
pub mod models;
pub mod recorder;
pub mod scanner;
pub mod services;
pub mod statistics;
