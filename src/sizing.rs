//! Position sizing
//!
//! Converts a per-trade risk budget into a signed, lot-rounded quantity and
//! a resting limit price.
//!
//! ```text
//! nominal_qty = size_adjustment * (risk_percent / 100) * portfolio_value / atr
//! ```
//!
//! The quantity is capped so that one ATR of adverse movement never costs
//! more than `max_risk_multiple` times the unadjusted single-trade risk.
//! All rounding is done in decimal arithmetic so lot and tick multiples are
//! exact.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::RiskConfig;
use crate::{Direction, MarketRegime, Side};

const BPS_PER_UNIT: Decimal = dec!(10000);
const PERCENT: Decimal = dec!(100);

fn decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value)
}

/// Truncate `quantity` toward zero to a multiple of `lot_size`
pub fn round_to_lot(quantity: f64, lot_size: f64) -> f64 {
    match (decimal(quantity), decimal(lot_size)) {
        (Some(q), Some(lot)) => q
            .checked_div(lot)
            .and_then(|lots| lots.trunc().checked_mul(lot))
            .and_then(|q| q.to_f64())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Round a price to the nearest multiple of `tick_size`
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    match (decimal(price), decimal(tick_size)) {
        (Some(p), Some(tick)) => p
            .checked_div(tick)
            .and_then(|ticks| ticks.round().checked_mul(tick))
            .and_then(|p| p.to_f64())
            .unwrap_or(price),
        _ => price,
    }
}

/// Limit price offset from `price` toward a prompt fill: above the market
/// for buys, below for sells.
pub fn limit_price(price: f64, side: Side, offset_bps: f64, tick_size: f64) -> f64 {
    let (Some(p), Some(bps)) = (decimal(price), decimal(offset_bps)) else {
        return round_to_tick(price, tick_size);
    };
    let offset = bps / BPS_PER_UNIT;
    let raw = match side {
        Side::Buy => p.checked_mul(Decimal::ONE + offset),
        Side::Sell => p.checked_mul(Decimal::ONE - offset),
    };
    round_to_tick(raw.and_then(|r| r.to_f64()).unwrap_or(price), tick_size)
}

/// Inputs for sizing one entry
#[derive(Debug, Clone, PartialEq)]
pub struct SizingRequest {
    pub direction: Direction,
    pub price: f64,
    pub atr: f64,
    pub portfolio_value: f64,
    pub size_adjustment: f64,
    pub regime: MarketRegime,
    pub lot_size: f64,
    pub tick_size: f64,
}

/// A sized entry order
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    /// Direction actually traded; differs from the signal in contrarian mode
    pub direction: Direction,
    /// Signed, lot-rounded quantity
    pub quantity: f64,
    pub limit_price: f64,
    /// Quantity cap before lot rounding
    pub max_quantity: f64,
    pub contrarian: bool,
}

/// Risk-budget position sizer
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSizer {
    pub risk_percent: f64,
    pub regime_risk_increment: f64,
    pub contrarian_enabled: bool,
    pub max_risk_multiple: f64,
    pub price_offset_bps: f64,
}

impl PositionSizer {
    pub fn new(risk_percent: f64) -> Self {
        Self {
            risk_percent,
            regime_risk_increment: 0.0,
            contrarian_enabled: false,
            max_risk_multiple: 5.0,
            price_offset_bps: 0.0,
        }
    }

    pub fn from_config(cfg: &RiskConfig) -> Self {
        Self::new(cfg.risk_percent)
            .with_regime_risk_increment(cfg.regime_risk_increment)
            .with_contrarian(cfg.contrarian_enabled)
            .with_max_risk_multiple(cfg.max_risk_multiple)
            .with_price_offset_bps(cfg.price_offset_bps)
    }

    /// Risk percent added when the regime agrees with the trade
    pub fn with_regime_risk_increment(mut self, increment: f64) -> Self {
        self.regime_risk_increment = increment;
        self
    }

    /// Trade against the signal when the regime opposes it
    pub fn with_contrarian(mut self, enabled: bool) -> Self {
        self.contrarian_enabled = enabled;
        self
    }

    pub fn with_max_risk_multiple(mut self, multiple: f64) -> Self {
        self.max_risk_multiple = multiple;
        self
    }

    pub fn with_price_offset_bps(mut self, bps: f64) -> Self {
        self.price_offset_bps = bps;
        self
    }

    /// Unsigned nominal quantity for a risk percent, before regime effects.
    /// `None` on overflow or an ATR too small to represent.
    fn raw_quantity(
        risk_percent: Decimal,
        size_adjustment: Decimal,
        portfolio_value: Decimal,
        atr: Decimal,
    ) -> Option<Decimal> {
        size_adjustment
            .checked_mul(risk_percent / PERCENT)?
            .checked_mul(portfolio_value)?
            .checked_div(atr)
    }

    /// Lot-rounded nominal quantity for the instrument's current size
    /// adjustment, ignoring the regime. Used to trim positions back to size.
    pub fn nominal_quantity(
        &self,
        size_adjustment: f64,
        portfolio_value: f64,
        atr: f64,
        lot_size: f64,
    ) -> f64 {
        if !(atr > 0.0) || !(portfolio_value > 0.0) {
            return 0.0;
        }
        let inputs = (
            decimal(self.risk_percent),
            decimal(size_adjustment),
            decimal(portfolio_value),
            decimal(atr),
        );
        let (Some(risk), Some(adj), Some(pv), Some(atr)) = inputs else {
            return 0.0;
        };
        let qty = Self::raw_quantity(risk, adj, pv, atr)
            .and_then(|q| q.to_f64())
            .unwrap_or(0.0);
        round_to_lot(qty, lot_size)
    }

    /// Size an entry. `None` when inputs are unusable or the quantity
    /// rounds to zero.
    pub fn size(&self, req: &SizingRequest) -> Option<SizedOrder> {
        if !(req.atr > 0.0) || !(req.portfolio_value > 0.0) || !(req.price > 0.0) {
            debug!(?req, "sizing skipped: non-positive inputs");
            return None;
        }

        let base_risk = decimal(self.risk_percent)?;
        let increment = decimal(self.regime_risk_increment)?;
        let adj = decimal(req.size_adjustment)?;
        let pv = decimal(req.portfolio_value)?;
        let atr = decimal(req.atr)?;

        let (risk, direction, contrarian) = if req.regime.agrees_with(req.direction) {
            (base_risk + increment, req.direction, false)
        } else if req.regime.opposes(req.direction) && self.contrarian_enabled {
            (
                (base_risk - increment).max(Decimal::ZERO),
                req.direction.opposite(),
                true,
            )
        } else {
            (base_risk, req.direction, false)
        };

        let Some(quantity) = Self::raw_quantity(risk, adj, pv, atr) else {
            debug!(?req, "sizing skipped: quantity out of decimal range");
            return None;
        };
        let cap = Self::raw_quantity(base_risk, decimal(self.max_risk_multiple)?, pv, atr)?;
        let capped = quantity.min(cap);

        let lots = round_to_lot(capped.to_f64()?, req.lot_size);
        if lots <= 0.0 {
            debug!(?req, "sizing produced zero quantity");
            return None;
        }

        let signed = direction.sign() * lots;
        let limit = limit_price(
            req.price,
            direction.entry_side(),
            self.price_offset_bps,
            req.tick_size,
        );

        debug!(
            ?direction,
            quantity = signed,
            cap = %cap,
            limit,
            regime = %req.regime,
            contrarian,
            "entry sized"
        );

        Some(SizedOrder {
            direction,
            quantity: signed,
            limit_price: limit,
            max_quantity: cap.to_f64()?,
            contrarian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sizer() -> PositionSizer {
        PositionSizer::new(0.3)
            .with_regime_risk_increment(0.05)
            .with_price_offset_bps(14.0)
    }

    fn request() -> SizingRequest {
        SizingRequest {
            direction: Direction::Long,
            price: 101.0,
            atr: 2.0,
            portfolio_value: 100_000.0,
            size_adjustment: 1.0,
            regime: MarketRegime::Unknown,
            lot_size: 0.001,
            tick_size: 0.01,
        }
    }

    #[test]
    fn test_entry_sizing_scenario() {
        let order = sizer().size(&request()).unwrap();
        assert_relative_eq!(order.quantity, 150.0);
        assert_relative_eq!(order.max_quantity, 750.0);
        assert_relative_eq!(order.limit_price, 101.14);
        assert_eq!(order.direction, Direction::Long);
        assert!(!order.contrarian);
    }

    #[test]
    fn test_regime_agreement_adds_risk() {
        let mut req = request();
        req.regime = MarketRegime::Bull;
        let order = sizer().size(&req).unwrap();
        // 0.35% of 100k / 2
        assert_relative_eq!(order.quantity, 175.0);
    }

    #[test]
    fn test_opposing_regime_without_contrarian_is_nominal() {
        let mut req = request();
        req.regime = MarketRegime::Bear;
        let order = sizer().size(&req).unwrap();
        assert_relative_eq!(order.quantity, 150.0);
    }

    #[test]
    fn test_contrarian_flips_and_reduces() {
        let mut req = request();
        req.regime = MarketRegime::Bear;
        let order = sizer().with_contrarian(true).size(&req).unwrap();
        assert_eq!(order.direction, Direction::Short);
        assert!(order.contrarian);
        // 0.25% of 100k / 2, sold
        assert_relative_eq!(order.quantity, -125.0);
        // sell limit sits below the market
        assert!(order.limit_price < req.price);
    }

    #[test]
    fn test_contrarian_floor_at_zero_risk() {
        let mut req = request();
        req.regime = MarketRegime::Bear;
        let s = PositionSizer::new(0.3)
            .with_regime_risk_increment(0.5)
            .with_contrarian(true);
        assert!(s.size(&req).is_none());
    }

    #[test]
    fn test_quantity_never_exceeds_cap() {
        let mut req = request();
        req.size_adjustment = 2.0;
        req.regime = MarketRegime::Bull;
        let s = sizer().with_max_risk_multiple(1.5);
        let order = s.size(&req).unwrap();
        // uncapped would be 350
        assert_relative_eq!(order.quantity, 225.0);
        assert!(order.quantity.abs() * req.atr <= 1.5 * 0.003 * req.portfolio_value + 1e-9);
    }

    #[test]
    fn test_lot_truncation() {
        assert_relative_eq!(round_to_lot(1.23456, 0.01), 1.23);
        assert_relative_eq!(round_to_lot(-1.23456, 0.01), -1.23);
        assert_relative_eq!(round_to_lot(0.009, 0.01), 0.0);
        let mut req = request();
        req.lot_size = 7.0;
        assert_relative_eq!(sizer().size(&req).unwrap().quantity, 147.0);
    }

    #[test]
    fn test_limit_price_rounding() {
        assert_relative_eq!(limit_price(101.0, Side::Buy, 14.0, 0.01), 101.14);
        assert_relative_eq!(limit_price(101.0, Side::Sell, 14.0, 0.01), 100.86);
        assert_relative_eq!(limit_price(101.0, Side::Buy, 0.0, 0.5), 101.0);
        assert_relative_eq!(round_to_tick(101.26, 0.5), 101.5);
    }

    #[test]
    fn test_invalid_inputs_skip() {
        let mut req = request();
        req.atr = 0.0;
        assert!(sizer().size(&req).is_none());
    }

    #[test]
    fn test_degenerate_atr_and_huge_values_skip() {
        // positive but below decimal precision
        let mut req = request();
        req.atr = 1e-30;
        assert!(sizer().size(&req).is_none());
        assert_eq!(sizer().nominal_quantity(1.0, 100_000.0, 1e-30, 1.0), 0.0);

        let mut req = request();
        req.portfolio_value = 1e28;
        req.atr = 1e-20;
        assert!(sizer().size(&req).is_none());
        assert_eq!(sizer().nominal_quantity(1.0, 1e28, 1e-20, 1.0), 0.0);

        assert_eq!(round_to_lot(1e25, 1e-20), 0.0);
        assert_relative_eq!(round_to_tick(101.26, 1e-30), 101.26);
    }

    #[test]
    fn test_nominal_quantity() {
        assert_relative_eq!(sizer().nominal_quantity(1.0, 100_000.0, 2.0, 0.001), 150.0);
        assert_relative_eq!(sizer().nominal_quantity(0.5, 100_000.0, 2.0, 1.0), 75.0);
        assert_eq!(sizer().nominal_quantity(1.0, 100_000.0, 0.0, 1.0), 0.0);
    }
}
