//! Breakout Governor
//!
//! Per-bar trading core for a universe of crypto instruments: a Donchian /
//! VWAP breakout state machine with live and shadow trackers, an
//! expectancy-ranked risk sizer, and a portfolio governor enforcing
//! regime-dependent exposure caps and a drawdown breaker.

pub mod audit;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod expectancy;
pub mod gateway;
pub mod governor;
pub mod indicators;
pub mod instrument;
pub mod notify;
pub mod regime;
pub mod signal;
pub mod sizing;
pub mod types;

pub use config::Config;
pub use engine::{BarEngine, BarReport};
pub use error::{CoreError, CoreResult};
pub use types::*;
