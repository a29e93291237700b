//! Error taxonomy for the trading core
//!
//! Per-instrument errors are caught at the instrument boundary by the bar
//! engine; only `ConfigInvalid` is fatal, and only at startup.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Warm-up in progress. Skip the instrument this bar.
    #[error("indicator not ready: {0}")]
    IndicatorNotReady(&'static str),

    /// No usable bar for the instrument this tick (absent or zero volume).
    #[error("missing bar data for {0}")]
    MissingBarData(String),

    /// A bar was delivered that is not strictly after the last applied one.
    #[error("bar at {at} is not after last applied bar at {last}")]
    DuplicateBar {
        at: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    #[error("market regime unavailable: {0}")]
    RegimeUnavailable(String),

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailure(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
}

impl CoreError {
    /// Expected skips (warm-up, gaps) as opposed to real failures
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            CoreError::IndicatorNotReady(_) | CoreError::MissingBarData(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_classification() {
        assert!(CoreError::IndicatorNotReady("atr").is_skip());
        assert!(CoreError::MissingBarData("BTCUSDT".into()).is_skip());
        assert!(!CoreError::ConfigInvalid("x".into()).is_skip());
        assert!(!CoreError::OrderRejected {
            symbol: "BTCUSDT".into(),
            reason: "margin".into()
        }
        .is_skip());
    }
}
