//! Core data types used across the trading core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// Typical price used by the VWAP accumulator
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense handle into the instrument arena.
///
/// Handles are assigned once when the universe is defined and stay valid
/// until it is redefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId(pub usize);

impl InstrumentId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Direction of a (live or hypothetical) position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for long, -1.0 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Direction implied by a signed quantity; `None` when flat
    pub fn from_quantity(quantity: f64) -> Option<Self> {
        if quantity > 0.0 {
            Some(Direction::Long)
        } else if quantity < 0.0 {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

/// Externally classified market bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Bull,
    Bear,
    #[default]
    Unknown,
}

impl MarketRegime {
    /// Whether the regime favours trades in `direction`
    pub fn agrees_with(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (MarketRegime::Bull, Direction::Long) | (MarketRegime::Bear, Direction::Short)
        )
    }

    /// Whether the regime is against trades in `direction`
    pub fn opposes(self, direction: Direction) -> bool {
        self.agrees_with(direction.opposite())
    }
}

impl FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bull" | "1" => Ok(MarketRegime::Bull),
            "bear" | "-1" => Ok(MarketRegime::Bear),
            "unknown" | "0" | "" => Ok(MarketRegime::Unknown),
            other => Err(format!("unrecognized regime '{}'", other)),
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketRegime::Bull => "bull",
            MarketRegime::Bear => "bear",
            MarketRegime::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Why an order intent was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderReason {
    EntryLong,
    EntryShort,
    ExitVwap,
    ExitStop,
    HardStop,
    BreakerClose,
    BreakerHalve,
    ProfitTrim,
    ProfitClose,
}

impl OrderReason {
    pub fn tag(self) -> &'static str {
        match self {
            OrderReason::EntryLong => "entry_long",
            OrderReason::EntryShort => "entry_short",
            OrderReason::ExitVwap => "exit_vwap",
            OrderReason::ExitStop => "exit_stop",
            OrderReason::HardStop => "hard_stop",
            OrderReason::BreakerClose => "breaker_close",
            OrderReason::BreakerHalve => "breaker_halve",
            OrderReason::ProfitTrim => "profit_trim",
            OrderReason::ProfitClose => "profit_close",
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, OrderReason::EntryLong | OrderReason::EntryShort)
    }
}

impl fmt::Display for OrderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The only artifact the core hands to the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub instrument: InstrumentId,
    pub symbol: Symbol,
    /// Signed quantity: positive buys, negative sells
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub reason: OrderReason,
}

impl OrderIntent {
    pub fn side(&self) -> Side {
        if self.quantity >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Signed notional at the limit price (or `reference` for market orders)
    pub fn notional(&self, reference: f64) -> f64 {
        self.quantity * self.limit_price.unwrap_or(reference)
    }
}

/// Order ID assigned by the execution gateway
pub type OrderId = u64;

/// Execution status carried by a gateway report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

/// Asynchronous fill / rejection notification correlated by order id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: OrderId,
    pub instrument: InstrumentId,
    pub status: ExecutionStatus,
    /// Signed quantity filled by this report (zero for rejections)
    pub filled_quantity: f64,
    pub fill_price: f64,
    pub message: Option<String>,
}

impl ExecutionReport {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ExecutionStatus::PartiallyFilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_candle_validation() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(Candle::new(dt, 100.0, 101.0, 99.0, 100.5, 10.0).is_ok());
        assert!(matches!(
            Candle::new(dt, 100.0, 99.0, 101.0, 100.0, 10.0),
            Err(CandleValidationError::HighLessThanLow { .. })
        ));
        assert!(matches!(
            Candle::new(dt, 100.0, 101.0, 99.0, 100.0, -1.0),
            Err(CandleValidationError::NegativeVolume(_))
        ));
        assert!(matches!(
            Candle::new(dt, 100.0, 101.0, 99.0, 102.0, 1.0),
            Err(CandleValidationError::CloseOutOfRange { .. })
        ));
    }

    #[test]
    fn test_regime_agreement() {
        assert!(MarketRegime::Bull.agrees_with(Direction::Long));
        assert!(MarketRegime::Bear.agrees_with(Direction::Short));
        assert!(MarketRegime::Bear.opposes(Direction::Long));
        assert!(!MarketRegime::Unknown.agrees_with(Direction::Long));
        assert!(!MarketRegime::Unknown.opposes(Direction::Short));
    }

    #[test]
    fn test_regime_parse() {
        assert_eq!("Bull".parse::<MarketRegime>(), Ok(MarketRegime::Bull));
        assert_eq!("-1".parse::<MarketRegime>(), Ok(MarketRegime::Bear));
        assert_eq!("".parse::<MarketRegime>(), Ok(MarketRegime::Unknown));
        assert!("sideways".parse::<MarketRegime>().is_err());
    }

    #[test]
    fn test_intent_side_and_notional() {
        let intent = OrderIntent {
            instrument: InstrumentId(0),
            symbol: Symbol::new("BTCUSDT"),
            quantity: -2.0,
            limit_price: Some(50.0),
            reason: OrderReason::ExitStop,
        };
        assert_eq!(intent.side(), Side::Sell);
        assert_eq!(intent.notional(99.0), -100.0);
    }

    #[test]
    fn test_symbol_serde() {
        let symbol = Symbol::new("ETHUSDT");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"ETHUSDT\"");
        let parsed: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, symbol);
    }
}
