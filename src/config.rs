//! Configuration management
//!
//! Handles loading, defaulting and validation of the JSON configuration
//! file. The engine holds a validated snapshot behind an `Arc`; nothing
//! reads configuration from ambient global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::expectancy::ExpectancyMode;
use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load and validate configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Symbols of the configured universe, in configuration order
    pub fn symbols(&self) -> Vec<Symbol> {
        self.trading
            .instruments
            .iter()
            .map(|i| Symbol::new(&i.symbol))
            .collect()
    }

    /// Reject configurations the core cannot trade safely with
    pub fn validate(&self) -> CoreResult<()> {
        self.trading.validate()?;
        self.strategy.validate()?;
        self.risk.validate()?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::ConfigInvalid(msg.into())
}

/// Trading universe and capital
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            initial_capital: default_initial_capital(),
        }
    }
}

impl TradingConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.instruments.is_empty() {
            return Err(invalid("trading.instruments must not be empty"));
        }
        if !(self.initial_capital > 0.0) {
            return Err(invalid("trading.initial_capital must be positive"));
        }
        let mut seen = HashSet::new();
        for inst in &self.instruments {
            if inst.symbol.trim().is_empty() {
                return Err(invalid("instrument symbol must not be empty"));
            }
            if !seen.insert(inst.symbol.as_str()) {
                return Err(invalid(format!("duplicate instrument {}", inst.symbol)));
            }
            if !(inst.lot_size > 0.0) || !(inst.tick_size > 0.0) {
                return Err(invalid(format!(
                    "{}: lot_size and tick_size must be positive",
                    inst.symbol
                )));
            }
        }
        Ok(())
    }
}

/// Per-instrument exchange metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
}

impl InstrumentConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            lot_size: default_lot_size(),
            tick_size: default_tick_size(),
        }
    }
}

/// Indicator and signal parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_donchian_period")]
    pub donchian_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_stop_multiplier")]
    pub stop_multiplier: f64,
    #[serde(default = "default_short_vol_window")]
    pub short_vol_window: usize,
    #[serde(default = "default_long_vol_window")]
    pub long_vol_window: usize,
    #[serde(default = "default_roc_period")]
    pub roc_period: usize,
    /// Ratchet stops toward VWAP while short-term volatility is expanding
    #[serde(default)]
    pub volatility_trigger_enabled: bool,
    #[serde(default = "default_true")]
    pub allow_shorts: bool,
    #[serde(default = "default_max_weekly_trades")]
    pub max_weekly_trades: u32,
    #[serde(default)]
    pub expectancy_mode: ExpectancyMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            donchian_period: default_donchian_period(),
            atr_period: default_atr_period(),
            stop_multiplier: default_stop_multiplier(),
            short_vol_window: default_short_vol_window(),
            long_vol_window: default_long_vol_window(),
            roc_period: default_roc_period(),
            volatility_trigger_enabled: false,
            allow_shorts: true,
            max_weekly_trades: default_max_weekly_trades(),
            expectancy_mode: ExpectancyMode::default(),
            top_k: default_top_k(),
        }
    }
}

impl StrategyConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.donchian_period == 0 || self.atr_period == 0 || self.roc_period == 0 {
            return Err(invalid("indicator periods must be positive"));
        }
        if self.short_vol_window < 2 || self.long_vol_window < self.short_vol_window {
            return Err(invalid(
                "volatility windows must satisfy 2 <= short_vol_window <= long_vol_window",
            ));
        }
        if !(self.stop_multiplier > 0.0) {
            return Err(invalid("strategy.stop_multiplier must be positive"));
        }
        if self.top_k == 0 {
            return Err(invalid("strategy.top_k must be positive"));
        }
        Ok(())
    }
}

/// Sizing and portfolio risk parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Percent of portfolio value risked per ATR of adverse move
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,
    #[serde(default = "default_regime_risk_increment")]
    pub regime_risk_increment: f64,
    #[serde(default)]
    pub contrarian_enabled: bool,
    #[serde(default = "default_max_risk_multiple")]
    pub max_risk_multiple: f64,
    #[serde(default = "default_price_offset_bps")]
    pub price_offset_bps: f64,
    /// Nominal gross exposure multiple of portfolio value
    #[serde(default = "default_max_portfolio_exposure")]
    pub max_portfolio_exposure: f64,
    /// Unrealized P&L ratio (negative) that trips the breaker
    #[serde(default = "default_drawdown_threshold")]
    pub drawdown_threshold: f64,
    /// Positions whose unrealized profit / portfolio value is below this are closed on trip
    #[serde(default = "default_drawdown_risk_reduction")]
    pub drawdown_risk_reduction: f64,
    #[serde(default = "default_breaker_halve_count")]
    pub breaker_halve_count: usize,
    #[serde(default = "default_profit_protect_threshold")]
    pub profit_protect_threshold: Option<f64>,
    /// Per-trade loss limit in percent of portfolio value at open
    #[serde(default)]
    pub hard_stop_percent: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_percent: default_risk_percent(),
            regime_risk_increment: default_regime_risk_increment(),
            contrarian_enabled: false,
            max_risk_multiple: default_max_risk_multiple(),
            price_offset_bps: default_price_offset_bps(),
            max_portfolio_exposure: default_max_portfolio_exposure(),
            drawdown_threshold: default_drawdown_threshold(),
            drawdown_risk_reduction: default_drawdown_risk_reduction(),
            breaker_halve_count: default_breaker_halve_count(),
            profit_protect_threshold: default_profit_protect_threshold(),
            hard_stop_percent: None,
        }
    }
}

impl RiskConfig {
    fn validate(&self) -> CoreResult<()> {
        if !(self.risk_percent > 0.0 && self.risk_percent <= 100.0) {
            return Err(invalid("risk.risk_percent must be in (0, 100]"));
        }
        if self.regime_risk_increment < 0.0 {
            return Err(invalid("risk.regime_risk_increment must be >= 0"));
        }
        if self.max_risk_multiple < 1.0 {
            return Err(invalid("risk.max_risk_multiple must be >= 1"));
        }
        if !(0.0..10_000.0).contains(&self.price_offset_bps) {
            return Err(invalid("risk.price_offset_bps must be in [0, 10000)"));
        }
        if !(self.max_portfolio_exposure > 0.0) {
            return Err(invalid("risk.max_portfolio_exposure must be positive"));
        }
        if !(self.drawdown_threshold < 0.0) {
            return Err(invalid("risk.drawdown_threshold must be negative"));
        }
        if !(self.drawdown_risk_reduction >= 0.0) {
            return Err(invalid("risk.drawdown_risk_reduction must be >= 0"));
        }
        if self.breaker_halve_count == 0 {
            return Err(invalid("risk.breaker_halve_count must be positive"));
        }
        if matches!(self.profit_protect_threshold, Some(t) if !(t > 0.0)) {
            return Err(invalid("risk.profit_protect_threshold must be positive"));
        }
        if matches!(self.hard_stop_percent, Some(p) if !(p > 0.0)) {
            return Err(invalid("risk.hard_stop_percent must be positive"));
        }
        Ok(())
    }
}

/// Historical replay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default)]
    pub audit_db: Option<String>,
    /// Optional CSV of `date,regime` rows; regime is Unknown when absent
    #[serde(default)]
    pub regime_file: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timeframe: default_timeframe(),
            audit_db: None,
            regime_file: None,
        }
    }
}

fn default_initial_capital() -> f64 {
    100_000.0
}
fn default_lot_size() -> f64 {
    0.001
}
fn default_tick_size() -> f64 {
    0.01
}
fn default_donchian_period() -> usize {
    20
}
fn default_atr_period() -> usize {
    14
}
fn default_stop_multiplier() -> f64 {
    2.0
}
fn default_short_vol_window() -> usize {
    100
}
fn default_long_vol_window() -> usize {
    500
}
fn default_roc_period() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_max_weekly_trades() -> u32 {
    5
}
fn default_top_k() -> usize {
    10
}
fn default_risk_percent() -> f64 {
    0.3
}
fn default_regime_risk_increment() -> f64 {
    0.05
}
fn default_max_risk_multiple() -> f64 {
    5.0
}
fn default_price_offset_bps() -> f64 {
    14.0
}
fn default_max_portfolio_exposure() -> f64 {
    1.0
}
fn default_drawdown_threshold() -> f64 {
    -0.04
}
fn default_drawdown_risk_reduction() -> f64 {
    0.001
}
fn default_breaker_halve_count() -> usize {
    1
}
fn default_profit_protect_threshold() -> Option<f64> {
    Some(0.08)
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_timeframe() -> String {
    "1h".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.trading.instruments = vec![
            InstrumentConfig::new("BTCUSDT"),
            InstrumentConfig::new("ETHUSDT"),
        ];
        config
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid_config().validate().is_ok());
        assert_eq!(valid_config().strategy.top_k, 10);
        assert_eq!(valid_config().strategy.long_vol_window, 500);
    }

    #[test]
    fn test_empty_universe_rejected() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let mut config = valid_config();
        config
            .trading
            .instruments
            .push(InstrumentConfig::new("BTCUSDT"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_positive_drawdown_threshold_rejected() {
        let mut config = valid_config();
        config.risk.drawdown_threshold = 0.04;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vol_window_order_rejected() {
        let mut config = valid_config();
        config.strategy.short_vol_window = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_lot_and_tick_size_rejected() {
        let mut config = valid_config();
        config.trading.instruments[0].lot_size = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalid(_))
        ));

        let mut config = valid_config();
        config.trading.instruments[1].tick_size = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.risk.hard_stop_percent = Some(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "trading": { "instruments": [ { "symbol": "SOLUSDT", "lot_size": 0.1 } ] },
            "strategy": { "expectancy_mode": "median", "donchian_period": 30 },
            "risk": { "hard_stop_percent": 2.5 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.instruments[0].lot_size, 0.1);
        assert_eq!(config.trading.instruments[0].tick_size, 0.01);
        assert_eq!(config.strategy.expectancy_mode, ExpectancyMode::Median);
        assert_eq!(config.strategy.donchian_period, 30);
        assert_eq!(config.strategy.atr_period, 14);
        assert_eq!(config.risk.hard_stop_percent, Some(2.5));
        assert_eq!(config.backtest.timeframe, "1h");
        assert_eq!(config.symbols(), vec![Symbol::new("SOLUSDT")]);
    }
}
