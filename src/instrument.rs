//! Per-instrument state owned by the engine arena

use chrono::{DateTime, Datelike, Utc};
use tracing::{info, warn};

use crate::config::InstrumentConfig;
use crate::error::CoreResult;
use crate::expectancy::{RollingOutcomeWindow, TradeOutcome, SIZE_ADJUSTMENT_NEUTRAL};
use crate::indicators::{IndicatorEngine, IndicatorParams, IndicatorSnapshot};
use crate::signal::{Live, OpenTrade, Shadow, Tracker};
use crate::{Direction, ExecutionReport, ExecutionStatus, InstrumentId, OrderId, OrderReason, Symbol};

/// Entry details captured when a live entry intent is submitted; the live
/// tracker opens from these once the first fill arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub direction: Direction,
    pub stop: f64,
    pub atr: f64,
    pub mirrors_shadow: bool,
    pub portfolio_value: f64,
}

/// The single in-flight order for an instrument
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub order_id: OrderId,
    pub reason: OrderReason,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub entry: Option<PlannedEntry>,
}

/// Mirror of the venue position, updated from fills only
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivePosition {
    pub quantity: f64,
    pub avg_price: f64,
    /// Portfolio value when the position was opened, for the hard stop
    pub value_at_open: Option<f64>,
    /// The live trade is the same trade the shadow tracker is recording
    pub mirrors_shadow: bool,
}

impl LivePosition {
    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_quantity(self.quantity)
    }

    /// Apply a signed fill, returning realized P&L.
    /// `dust` is the magnitude below which the position snaps to flat.
    pub fn apply_fill(&mut self, quantity: f64, price: f64, dust: f64) -> f64 {
        let before = self.quantity;
        let after = before + quantity;
        let mut realized = 0.0;

        if before == 0.0 || before.signum() == quantity.signum() {
            let total = before.abs() + quantity.abs();
            self.avg_price = (self.avg_price * before.abs() + price * quantity.abs()) / total;
        } else {
            let closed = quantity.abs().min(before.abs());
            realized = before.signum() * closed * (price - self.avg_price);
            if after.abs() > dust && after.signum() != before.signum() {
                // flipped through zero
                self.avg_price = price;
            }
        }

        self.quantity = if after.abs() <= dust { 0.0 } else { after };
        if self.quantity == 0.0 {
            self.avg_price = 0.0;
            self.value_at_open = None;
            self.mirrors_shadow = false;
        }
        realized
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.quantity * (mark - self.avg_price)
    }
}

/// A live trade closed by a fill
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedLiveTrade {
    pub trade: OpenTrade,
    pub outcome: Option<TradeOutcome>,
    pub mirrors_shadow: bool,
}

/// What one execution report did to the instrument
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportEffect {
    pub realized_pnl: f64,
    pub opened: bool,
    pub closed: Option<ClosedLiveTrade>,
    pub rejected: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstrumentState {
    pub id: InstrumentId,
    pub symbol: Symbol,
    pub lot_size: f64,
    pub tick_size: f64,
    pub indicators: IndicatorEngine,
    pub snapshot: Option<IndicatorSnapshot>,
    pub live: Tracker<Live>,
    pub shadow: Tracker<Shadow>,
    pub position: LivePosition,
    pub pending: Option<PendingOrder>,
    pub size_adjustment: f64,
    pub weekly_trades: u32,
    trade_week: Option<(i32, u32)>,
    pub volatility_triggered: bool,
    pub window: RollingOutcomeWindow,
}

impl InstrumentState {
    pub fn new(
        id: InstrumentId,
        symbol: Symbol,
        cfg: &InstrumentConfig,
        params: IndicatorParams,
    ) -> CoreResult<Self> {
        Ok(Self {
            id,
            symbol,
            lot_size: cfg.lot_size,
            tick_size: cfg.tick_size,
            indicators: IndicatorEngine::new(params)?,
            snapshot: None,
            live: Tracker::new(),
            shadow: Tracker::new(),
            position: LivePosition::default(),
            pending: None,
            size_adjustment: SIZE_ADJUSTMENT_NEUTRAL,
            weekly_trades: 0,
            trade_week: None,
            volatility_triggered: false,
            window: RollingOutcomeWindow::new(),
        })
    }

    /// Last close seen for the instrument
    pub fn mark_price(&self) -> Option<f64> {
        self.snapshot.as_ref().map(|s| s.close)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        match self.mark_price() {
            Some(mark) if !self.position.is_flat() => self.position.unrealized_pnl(mark),
            _ => 0.0,
        }
    }

    /// Reset the weekly trade counter when the ISO week changes
    pub fn roll_week(&mut self, ts: DateTime<Utc>) {
        let iso = ts.iso_week();
        let key = (iso.year(), iso.week());
        if self.trade_week != Some(key) {
            self.trade_week = Some(key);
            self.weekly_trades = 0;
        }
    }

    fn dust(&self) -> f64 {
        self.lot_size * 1e-6
    }

    /// Reconcile one execution report against the mirrored position and
    /// the live tracker.
    pub fn apply_report(&mut self, report: &ExecutionReport, at: DateTime<Utc>) -> ReportEffect {
        let mut effect = ReportEffect::default();
        let matches_pending = self
            .pending
            .as_ref()
            .is_some_and(|p| p.order_id == report.order_id);
        if !matches_pending {
            warn!(
                symbol = %self.symbol,
                order_id = report.order_id,
                "execution report for an order that is not pending"
            );
        }

        match report.status {
            ExecutionStatus::Rejected | ExecutionStatus::Cancelled => {
                if matches_pending {
                    self.pending = None;
                }
                effect.rejected = Some(
                    report
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("{:?}", report.status)),
                );
                return effect;
            }
            ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled => {}
        }

        if report.filled_quantity != 0.0 {
            let was_flat = self.position.is_flat();
            let mirrored = self.position.mirrors_shadow;
            let dust = self.dust();
            effect.realized_pnl =
                self.position
                    .apply_fill(report.filled_quantity, report.fill_price, dust);

            let planned = self
                .pending
                .as_ref()
                .filter(|_| matches_pending)
                .and_then(|p| p.entry.clone());

            if let Some(plan) = planned {
                if !self.live.is_open() && !self.position.is_flat() {
                    self.live.enter(OpenTrade {
                        direction: plan.direction,
                        entry_price: self.position.avg_price,
                        atr_at_entry: plan.atr,
                        stop: Some(plan.stop),
                        opened_at: at,
                    });
                    self.position.value_at_open = Some(plan.portfolio_value);
                    self.position.mirrors_shadow = plan.mirrors_shadow;
                    effect.opened = true;
                    info!(
                        symbol = %self.symbol,
                        direction = ?plan.direction,
                        quantity = self.position.quantity,
                        price = self.position.avg_price,
                        "live position opened"
                    );
                } else if let Some(trade) = self.live.open_trade_mut() {
                    trade.entry_price = self.position.avg_price;
                }
            }

            if !was_flat && self.position.is_flat() {
                if let Some((trade, outcome)) = self.live.close(report.fill_price, at) {
                    info!(
                        symbol = %self.symbol,
                        price = report.fill_price,
                        outcome = ?outcome.map(|o| o.value()),
                        "live position closed"
                    );
                    effect.closed = Some(ClosedLiveTrade {
                        trade,
                        outcome,
                        mirrors_shadow: mirrored,
                    });
                }
            }
        }

        if matches_pending && report.status == ExecutionStatus::Filled {
            self.pending = None;
        }
        effect
    }
}
