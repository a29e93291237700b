//! Portfolio risk governor
//!
//! Portfolio-level controls applied after per-instrument evaluation:
//! - regime-dependent gross exposure caps on new entries
//! - a two-state drawdown breaker (Armed / Triggered)
//! - profit protection when unrealized gains run far ahead
//! - an optional hard per-trade stop
//!
//! Holdings are fixed at bar start. Entries accepted by the gateway during
//! the bar go into a separate accumulator so several entries in one bar
//! cannot jointly overshoot the cap.

use chrono::{DateTime, Duration, Timelike, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::sizing::round_to_lot;
use crate::{InstrumentId, MarketRegime, OrderReason, Symbol};

/// Drawdown breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    /// A breach fully closes the weakest position
    #[default]
    Armed,
    /// Further breaches only halve the largest winners
    Triggered,
}

/// Governor thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    pub max_portfolio_exposure: f64,
    pub drawdown_threshold: f64,
    pub drawdown_risk_reduction: f64,
    pub breaker_halve_count: usize,
    pub profit_protect_threshold: Option<f64>,
    pub hard_stop_percent: Option<f64>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for GovernorConfig {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            max_portfolio_exposure: cfg.max_portfolio_exposure,
            drawdown_threshold: cfg.drawdown_threshold,
            drawdown_risk_reduction: cfg.drawdown_risk_reduction,
            breaker_halve_count: cfg.breaker_halve_count,
            profit_protect_threshold: cfg.profit_protect_threshold,
            hard_stop_percent: cfg.hard_stop_percent,
        }
    }
}

impl GovernorConfig {
    pub fn with_max_portfolio_exposure(mut self, exposure: f64) -> Self {
        self.max_portfolio_exposure = exposure;
        self
    }

    pub fn with_drawdown(mut self, threshold: f64, risk_reduction: f64) -> Self {
        self.drawdown_threshold = threshold;
        self.drawdown_risk_reduction = risk_reduction;
        self
    }

    pub fn with_profit_protect_threshold(mut self, threshold: Option<f64>) -> Self {
        self.profit_protect_threshold = threshold;
        self
    }

    pub fn with_hard_stop_percent(mut self, percent: Option<f64>) -> Self {
        self.hard_stop_percent = percent;
        self
    }

    pub fn build(self) -> PortfolioRiskGovernor {
        PortfolioRiskGovernor::new(self)
    }
}

/// Exposure multiples of portfolio value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureLimits {
    pub max_long: f64,
    pub max_short: f64,
}

impl ExposureLimits {
    pub fn for_regime(regime: MarketRegime, nominal: f64) -> Self {
        match regime {
            MarketRegime::Bull => Self {
                max_long: nominal,
                max_short: nominal / 2.0,
            },
            MarketRegime::Bear => Self {
                max_long: nominal / 2.0,
                max_short: nominal,
            },
            MarketRegime::Unknown => Self {
                max_long: 0.75 * nominal,
                max_short: 0.75 * nominal,
            },
        }
    }
}

/// Read-only view of one instrument's live position
#[derive(Debug, Clone, PartialEq)]
pub struct PositionView {
    pub instrument: InstrumentId,
    pub symbol: Symbol,
    pub quantity: f64,
    pub avg_price: f64,
    pub mark_price: f64,
    pub expectancy: Option<f64>,
    /// Lot-rounded quantity the sizer would open today
    pub nominal_quantity: f64,
    pub value_at_open: Option<f64>,
    pub has_pending: bool,
    /// Signed notional of a pending, not yet filled entry
    pub pending_entry_notional: f64,
    pub lot_size: f64,
}

impl PositionView {
    pub fn unrealized_pnl(&self) -> f64 {
        self.quantity * (self.mark_price - self.avg_price)
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.avg_price
    }
}

/// A position adjustment requested by the governor
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorAction {
    pub instrument: InstrumentId,
    pub symbol: Symbol,
    /// Signed quantity to trade
    pub quantity: f64,
    pub reason: OrderReason,
    pub mark_price: f64,
}

/// Outcome of checking an entry against the exposure cap
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Approved(f64),
    Resized(f64),
    Rejected,
}

impl EntryDecision {
    pub fn quantity(&self) -> Option<f64> {
        match self {
            EntryDecision::Approved(q) | EntryDecision::Resized(q) => Some(*q),
            EntryDecision::Rejected => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortfolioRiskGovernor {
    config: GovernorConfig,
    regime: MarketRegime,
    limits: ExposureLimits,
    holdings: f64,
    in_bar: f64,
    portfolio_value: f64,
    high_water_mark: f64,
    breaker: BreakerState,
    rearm_at: Option<DateTime<Utc>>,
}

fn next_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
        + Duration::hours(1)
}

impl PortfolioRiskGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let regime = MarketRegime::Unknown;
        Self {
            limits: ExposureLimits::for_regime(regime, config.max_portfolio_exposure),
            config,
            regime,
            holdings: 0.0,
            in_bar: 0.0,
            portfolio_value: 0.0,
            high_water_mark: 0.0,
            breaker: BreakerState::Armed,
            rearm_at: None,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Swap thresholds at a reload point; breaker and holdings are kept
    pub fn reconfigure(&mut self, config: GovernorConfig) {
        self.config = config;
        self.limits = ExposureLimits::for_regime(self.regime, self.config.max_portfolio_exposure);
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker
    }

    pub fn regime(&self) -> MarketRegime {
        self.regime
    }

    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    pub fn holdings(&self) -> f64 {
        self.holdings
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Fractional decline of portfolio value from its high-water mark
    pub fn drawdown(&self) -> f64 {
        if self.high_water_mark > 0.0 {
            (self.high_water_mark - self.portfolio_value) / self.high_water_mark
        } else {
            0.0
        }
    }

    pub fn set_regime(&mut self, regime: MarketRegime) {
        if regime != self.regime {
            info!(from = %self.regime, to = %regime, "market regime changed");
        }
        self.regime = regime;
        self.limits = ExposureLimits::for_regime(regime, self.config.max_portfolio_exposure);
    }

    /// Snapshot holdings for the bar and re-arm the breaker if its hour has passed
    pub fn begin_bar(&mut self, ts: DateTime<Utc>, portfolio_value: f64, positions: &[PositionView]) {
        self.portfolio_value = portfolio_value;
        self.high_water_mark = self.high_water_mark.max(portfolio_value);
        self.holdings = positions
            .iter()
            .map(|p| p.notional() + p.pending_entry_notional)
            .sum();
        self.in_bar = 0.0;

        if self.breaker == BreakerState::Triggered && self.rearm_at.is_some_and(|at| ts >= at) {
            info!(%ts, "drawdown breaker re-armed");
            self.breaker = BreakerState::Armed;
            self.rearm_at = None;
        }
    }

    pub fn end_bar(&mut self) {
        self.in_bar = 0.0;
    }

    /// Validate a signed entry quantity against the exposure cap, shrinking
    /// it to the remaining headroom when it would breach. Nothing is
    /// reserved until [`record_entry`](Self::record_entry).
    pub fn check_entry(&self, quantity: f64, price: f64, lot_size: f64) -> EntryDecision {
        if quantity == 0.0 || !(price > 0.0) || !(self.portfolio_value > 0.0) {
            return EntryDecision::Rejected;
        }
        let current = self.holdings + self.in_bar;
        let notional = quantity * price;
        let long_cap = self.limits.max_long * self.portfolio_value;
        let short_cap = -self.limits.max_short * self.portfolio_value;
        let projected = current + notional;

        if projected <= long_cap && projected >= short_cap {
            return EntryDecision::Approved(quantity);
        }

        let headroom = if quantity > 0.0 {
            long_cap - current
        } else {
            current - short_cap
        };
        if headroom <= 0.0 {
            debug!(current, notional, "entry rejected: exposure cap reached");
            return EntryDecision::Rejected;
        }

        // an entry against a breach on the other side only needs to stay
        // inside its own cap
        let allowed = round_to_lot(headroom / price, lot_size);
        if allowed >= quantity.abs() {
            return EntryDecision::Approved(quantity);
        }
        if allowed == 0.0 {
            return EntryDecision::Rejected;
        }
        let resized = quantity.signum() * allowed;
        debug!(requested = quantity, resized, "entry resized to exposure headroom");
        EntryDecision::Resized(resized)
    }

    /// Count an accepted entry against this bar's headroom
    pub fn record_entry(&mut self, quantity: f64, price: f64) {
        self.in_bar += quantity * price;
    }

    /// Aggregate unrealized P&L as a fraction of portfolio value
    pub fn unrealized_ratio(&self, positions: &[PositionView]) -> f64 {
        if !(self.portfolio_value > 0.0) {
            return 0.0;
        }
        positions.iter().map(PositionView::unrealized_pnl).sum::<f64>() / self.portfolio_value
    }

    /// Portfolio-level checks. At most one action per instrument, and none
    /// for instruments that already have an order in flight.
    pub fn evaluate(&mut self, ts: DateTime<Utc>, positions: &[PositionView]) -> Vec<GovernorAction> {
        let mut actions = Vec::new();
        let mut handled: HashSet<InstrumentId> = positions
            .iter()
            .filter(|p| p.has_pending || p.quantity == 0.0)
            .map(|p| p.instrument)
            .collect();

        if let Some(limit) = self.config.hard_stop_percent {
            let candidates: Vec<&PositionView> = positions
                .iter()
                .filter(|p| !handled.contains(&p.instrument))
                .collect();
            for p in candidates {
                let Some(base) = p.value_at_open.filter(|v| *v > 0.0) else {
                    continue;
                };
                let loss_pct = p.unrealized_pnl() / base * 100.0;
                if loss_pct < -limit {
                    warn!(symbol = %p.symbol, loss_pct, limit, "hard stop hit");
                    actions.push(close(p, OrderReason::HardStop));
                    handled.insert(p.instrument);
                }
            }
        }

        let ratio = self.unrealized_ratio(positions);

        if ratio < self.config.drawdown_threshold {
            match self.breaker {
                BreakerState::Armed => {
                    let weakest = positions
                        .iter()
                        .filter(|p| !handled.contains(&p.instrument))
                        .filter(|p| {
                            p.unrealized_pnl() / self.portfolio_value
                                < self.config.drawdown_risk_reduction
                        })
                        .min_by_key(|p| OrderedFloat(p.unrealized_pnl()));
                    if let Some(p) = weakest {
                        actions.push(close(p, OrderReason::BreakerClose));
                        handled.insert(p.instrument);
                    }
                    self.breaker = BreakerState::Triggered;
                    self.rearm_at = Some(next_hour(ts));
                    warn!(
                        ratio,
                        threshold = self.config.drawdown_threshold,
                        "drawdown breaker triggered"
                    );
                }
                BreakerState::Triggered => {
                    let winners: Vec<&PositionView> = positions
                        .iter()
                        .filter(|p| !handled.contains(&p.instrument))
                        .filter(|p| p.unrealized_pnl() > 0.0)
                        .sorted_by_key(|p| std::cmp::Reverse(OrderedFloat(p.unrealized_pnl())))
                        .take(self.config.breaker_halve_count)
                        .collect();
                    for p in winners {
                        let half =
                            p.quantity.signum() * round_to_lot(p.quantity.abs() / 2.0, p.lot_size);
                        if half != 0.0 {
                            info!(symbol = %p.symbol, quantity = half, "halving winner under breaker");
                            actions.push(action(p, -half, OrderReason::BreakerHalve));
                            handled.insert(p.instrument);
                        }
                    }
                }
            }
        } else if let Some(threshold) = self.config.profit_protect_threshold {
            if ratio > threshold {
                info!(ratio, threshold, "profit protection engaged");
                let candidates: Vec<&PositionView> = positions
                    .iter()
                    .filter(|p| !handled.contains(&p.instrument))
                    .collect();
                for p in candidates {
                    match p.expectancy {
                        Some(e) if e > 0.0 => {
                            let excess = p.quantity.abs() - p.nominal_quantity;
                            if p.nominal_quantity > 0.0 && excess > 0.0 {
                                let trim = round_to_lot(excess, p.lot_size);
                                if trim > 0.0 {
                                    actions.push(action(
                                        p,
                                        -p.quantity.signum() * trim,
                                        OrderReason::ProfitTrim,
                                    ));
                                    handled.insert(p.instrument);
                                }
                            }
                        }
                        _ => {
                            actions.push(close(p, OrderReason::ProfitClose));
                            handled.insert(p.instrument);
                        }
                    }
                }
            }
        }

        actions
    }
}

fn action(p: &PositionView, quantity: f64, reason: OrderReason) -> GovernorAction {
    GovernorAction {
        instrument: p.instrument,
        symbol: p.symbol.clone(),
        quantity,
        reason,
        mark_price: p.mark_price,
    }
}

fn close(p: &PositionView, reason: OrderReason) -> GovernorAction {
    action(p, -p.quantity, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, 0).unwrap()
    }

    fn position(id: usize, quantity: f64, avg: f64, mark: f64) -> PositionView {
        PositionView {
            instrument: InstrumentId(id),
            symbol: Symbol::new(format!("SYM{}", id)),
            quantity,
            avg_price: avg,
            mark_price: mark,
            expectancy: Some(0.5),
            nominal_quantity: quantity.abs(),
            value_at_open: Some(100_000.0),
            has_pending: false,
            pending_entry_notional: 0.0,
            lot_size: 1.0,
        }
    }

    fn governor() -> PortfolioRiskGovernor {
        GovernorConfig::default()
            .with_max_portfolio_exposure(1.0)
            .with_drawdown(-0.04, 0.001)
            .with_profit_protect_threshold(Some(0.08))
            .build()
    }

    #[test]
    fn test_regime_limits() {
        let bull = ExposureLimits::for_regime(MarketRegime::Bull, 1.0);
        assert_eq!((bull.max_long, bull.max_short), (1.0, 0.5));
        let bear = ExposureLimits::for_regime(MarketRegime::Bear, 1.0);
        assert_eq!((bear.max_long, bear.max_short), (0.5, 1.0));
        let unknown = ExposureLimits::for_regime(MarketRegime::Unknown, 2.0);
        assert_eq!((unknown.max_long, unknown.max_short), (1.5, 1.5));
    }

    #[test]
    fn test_bear_entry_resized_to_headroom() {
        let mut gov = governor();
        gov.set_regime(MarketRegime::Bear);
        // long holdings at 0.45 of portfolio value
        let positions = vec![position(0, 450.0, 100.0, 100.0)];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        // a new long worth 0.1 of portfolio value
        let decision = gov.check_entry(100.0, 100.0, 1.0);
        let qty = decision.quantity().unwrap();
        assert!(qty * 100.0 <= 0.05 * 100_000.0 + 1e-9);
        assert_eq!(decision, EntryDecision::Resized(50.0));
        gov.record_entry(qty, 100.0);
        // headroom consumed within the bar
        assert_eq!(gov.check_entry(10.0, 100.0, 1.0), EntryDecision::Rejected);
        // shorts still fit
        assert_eq!(gov.check_entry(-10.0, 100.0, 1.0), EntryDecision::Approved(-10.0));
    }

    #[test]
    fn test_reducing_entry_after_regime_flip_keeps_its_size() {
        let mut gov = governor();
        gov.set_regime(MarketRegime::Bear);
        // long holdings at 0.8 of portfolio value, above the 0.5 bear long cap
        let positions = vec![position(0, 800.0, 100.0, 100.0)];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        assert_eq!(gov.check_entry(-10.0, 100.0, 1.0), EntryDecision::Approved(-10.0));
        // adding to the breached side is still refused
        assert_eq!(gov.check_entry(10.0, 100.0, 1.0), EntryDecision::Rejected);
    }

    #[test]
    fn test_resize_never_enlarges_an_entry() {
        let mut gov = governor();
        gov.set_regime(MarketRegime::Bull);
        // short holdings at -0.7, beyond the 0.5 bull short cap
        let positions = vec![position(0, -700.0, 100.0, 100.0)];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        assert_eq!(gov.check_entry(5.0, 100.0, 1.0), EntryDecision::Approved(5.0));
        assert_eq!(gov.check_entry(1_500.0, 100.0, 1.0), EntryDecision::Approved(1_500.0));
        // a long that would cross the long cap is cut to it
        assert_eq!(gov.check_entry(2_000.0, 100.0, 1.0), EntryDecision::Resized(1_700.0));
    }

    #[test]
    fn test_check_entry_reserves_nothing() {
        let mut gov = governor();
        gov.begin_bar(ts(10, 0), 100_000.0, &[]);
        assert_eq!(gov.check_entry(700.0, 100.0, 1.0), EntryDecision::Approved(700.0));
        // the first entry never reached the gateway
        assert_eq!(gov.check_entry(700.0, 100.0, 1.0), EntryDecision::Approved(700.0));
        gov.record_entry(700.0, 100.0);
        assert_eq!(gov.check_entry(700.0, 100.0, 1.0), EntryDecision::Resized(50.0));
    }

    #[test]
    fn test_breaker_full_close_then_halve() {
        let mut gov = governor();
        // loser: -5600, winner: +600 -> ratio -5%
        let positions = vec![
            position(0, 100.0, 100.0, 44.0),
            position(1, 100.0, 100.0, 106.0),
        ];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        assert_relative_eq!(gov.unrealized_ratio(&positions), -0.05);
        let actions = gov.evaluate(ts(10, 0), &positions);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instrument, InstrumentId(0));
        assert_eq!(actions[0].reason, OrderReason::BreakerClose);
        assert_relative_eq!(actions[0].quantity, -100.0);
        assert_eq!(gov.breaker_state(), BreakerState::Triggered);

        // still breached within the same hour
        gov.begin_bar(ts(10, 30), 100_000.0, &positions);
        let actions = gov.evaluate(ts(10, 30), &positions);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instrument, InstrumentId(1));
        assert_eq!(actions[0].reason, OrderReason::BreakerHalve);
        assert_relative_eq!(actions[0].quantity, -50.0);
        assert!(!actions.iter().any(|a| a.reason == OrderReason::BreakerClose));
    }

    #[test]
    fn test_breaker_closes_only_the_weakest_position() {
        let mut gov = governor();
        let positions = vec![
            position(0, 100.0, 100.0, 75.0),  // -2500
            position(1, 100.0, 100.0, 70.0),  // -3000
            position(2, 100.0, 100.0, 100.5), // +50, below the risk fraction
        ];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        let actions = gov.evaluate(ts(10, 0), &positions);
        let closes: Vec<_> = actions
            .iter()
            .filter(|a| a.reason == OrderReason::BreakerClose)
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].instrument, InstrumentId(1));
        assert_eq!(actions.len(), 1);
        assert_eq!(gov.breaker_state(), BreakerState::Triggered);
    }

    #[test]
    fn test_hard_stop_and_breaker_share_a_bar() {
        let mut gov = GovernorConfig::default()
            .with_max_portfolio_exposure(1.0)
            .with_drawdown(-0.04, 0.001)
            .with_hard_stop_percent(Some(1.0))
            .build();
        let positions = vec![
            position(0, 100.0, 100.0, 40.0), // -6000, hard stop
            position(1, 100.0, 100.0, 99.0), // -100
        ];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        let actions = gov.evaluate(ts(10, 0), &positions);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].instrument, InstrumentId(0));
        assert_eq!(actions[0].reason, OrderReason::HardStop);
        assert_eq!(actions[1].instrument, InstrumentId(1));
        assert_eq!(actions[1].reason, OrderReason::BreakerClose);
    }

    #[test]
    fn test_breaker_rearms_next_hour() {
        let mut gov = governor();
        let positions = vec![position(0, 100.0, 100.0, 50.0)];
        gov.begin_bar(ts(10, 30), 100_000.0, &positions);
        let _ = gov.evaluate(ts(10, 30), &positions);
        assert_eq!(gov.breaker_state(), BreakerState::Triggered);
        gov.begin_bar(ts(10, 45), 100_000.0, &positions);
        assert_eq!(gov.breaker_state(), BreakerState::Triggered);
        gov.begin_bar(ts(11, 0), 100_000.0, &positions);
        assert_eq!(gov.breaker_state(), BreakerState::Armed);
    }

    #[test]
    fn test_pending_positions_are_skipped() {
        let mut gov = governor();
        let mut loser = position(0, 100.0, 100.0, 44.0);
        loser.has_pending = true;
        let positions = vec![loser];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        assert!(gov.evaluate(ts(10, 0), &positions).is_empty());
    }

    #[test]
    fn test_profit_protection() {
        let mut gov = governor();
        let mut good = position(0, 300.0, 100.0, 130.0); // +9000
        good.nominal_quantity = 200.0;
        let mut bad = position(1, 10.0, 100.0, 100.0);
        bad.expectancy = None;
        let positions = vec![good, bad];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        let actions = gov.evaluate(ts(10, 0), &positions);
        assert_eq!(actions.len(), 2);
        let trim = actions.iter().find(|a| a.instrument == InstrumentId(0)).unwrap();
        assert_eq!(trim.reason, OrderReason::ProfitTrim);
        assert_relative_eq!(trim.quantity, -100.0);
        let closed = actions.iter().find(|a| a.instrument == InstrumentId(1)).unwrap();
        assert_eq!(closed.reason, OrderReason::ProfitClose);
        assert_relative_eq!(closed.quantity, -10.0);
    }

    #[test]
    fn test_hard_stop() {
        let mut gov = GovernorConfig::default()
            .with_hard_stop_percent(Some(1.0))
            .build();
        let short = position(0, -100.0, 100.0, 111.0); // -1100 on 100k at open
        let positions = vec![short];
        gov.begin_bar(ts(10, 0), 100_000.0, &positions);
        let actions = gov.evaluate(ts(10, 0), &positions);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].reason, OrderReason::HardStop);
        assert_relative_eq!(actions[0].quantity, 100.0);
    }

    #[test]
    fn test_high_water_mark_and_drawdown() {
        let mut gov = governor();
        gov.begin_bar(ts(10, 0), 100_000.0, &[]);
        gov.begin_bar(ts(11, 0), 90_000.0, &[]);
        assert_eq!(gov.high_water_mark(), 100_000.0);
        assert_relative_eq!(gov.drawdown(), 0.1);
    }
}
