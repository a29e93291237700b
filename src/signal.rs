//! Per-instrument breakout state machine
//!
//! Each instrument carries two trackers fed by the same indicators: a live
//! tracker that mirrors the real position and a shadow tracker that trades
//! every signal hypothetically so trade quality keeps accruing while the
//! instrument is not eligible for live entries. The kinds are distinct
//! types, so a stop or entry record can never leak from one to the other.

use chrono::{DateTime, Timelike, Utc};
use std::marker::PhantomData;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::expectancy::TradeOutcome;
use crate::indicators::IndicatorSnapshot;
use crate::instrument::InstrumentState;
use crate::{Direction, OrderReason};

/// Marker for the tracker kind
pub trait TrackerKind {
    const LABEL: &'static str;
}

/// Tracker mirroring the venue position. Changes only on execution reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Live;

/// Hypothetical tracker that enters and exits on every signal
#[derive(Debug, Clone, Copy, Default)]
pub struct Shadow;

impl TrackerKind for Live {
    const LABEL: &'static str = "live";
}

impl TrackerKind for Shadow {
    const LABEL: &'static str = "shadow";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Flat,
    Long,
    Short,
}

/// An open trade as seen by one tracker
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrade {
    pub direction: Direction,
    pub entry_price: f64,
    pub atr_at_entry: f64,
    pub stop: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Tracker<K: TrackerKind> {
    open: Option<OpenTrade>,
    _kind: PhantomData<K>,
}

impl<K: TrackerKind> Default for Tracker<K> {
    fn default() -> Self {
        Self {
            open: None,
            _kind: PhantomData,
        }
    }
}

impl<K: TrackerKind> Tracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TrackerState {
        match self.open.as_ref().map(|t| t.direction) {
            None => TrackerState::Flat,
            Some(Direction::Long) => TrackerState::Long,
            Some(Direction::Short) => TrackerState::Short,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        self.open.as_ref().map(|t| t.direction)
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_trade(&self) -> Option<&OpenTrade> {
        self.open.as_ref()
    }

    pub fn stop(&self) -> Option<f64> {
        self.open.as_ref().and_then(|t| t.stop)
    }

    pub fn enter(&mut self, trade: OpenTrade) {
        debug!(
            tracker = K::LABEL,
            direction = ?trade.direction,
            entry = trade.entry_price,
            stop = ?trade.stop,
            "tracker opened"
        );
        self.open = Some(trade);
    }

    /// Move the stop to `candidate` if that is closer to price.
    /// Returns whether the stop moved.
    pub fn tighten_stop(&mut self, candidate: f64) -> bool {
        let Some(trade) = self.open.as_mut() else {
            return false;
        };
        let tighter = match (trade.direction, trade.stop) {
            (_, None) => true,
            (Direction::Long, Some(stop)) => candidate > stop,
            (Direction::Short, Some(stop)) => candidate < stop,
        };
        if tighter {
            trade.stop = Some(candidate);
        }
        tighter
    }

    /// Close the open trade at `exit_price`, producing its outcome
    pub fn close(
        &mut self,
        exit_price: f64,
        at: DateTime<Utc>,
    ) -> Option<(OpenTrade, Option<TradeOutcome>)> {
        let trade = self.open.take()?;
        let outcome = TradeOutcome::from_trade(
            trade.direction,
            trade.entry_price,
            exit_price,
            trade.atr_at_entry,
            at,
        );
        debug!(
            tracker = K::LABEL,
            direction = ?trade.direction,
            exit = exit_price,
            outcome = ?outcome.map(|o| o.value()),
            "tracker closed"
        );
        Some((trade, outcome))
    }

    pub(crate) fn open_trade_mut(&mut self) -> Option<&mut OpenTrade> {
        self.open.as_mut()
    }
}

/// Bars on the hour or half hour
pub fn is_boundary_bar(ts: DateTime<Utc>) -> bool {
    matches!(ts.minute(), 0 | 30)
}

pub fn initial_stop(direction: Direction, close: f64, atr: f64, multiplier: f64) -> f64 {
    close - direction.sign() * multiplier * atr
}

/// Stop level anchored on VWAP, used for volatility tightening
pub fn vwap_stop(direction: Direction, vwap: f64, atr: f64, multiplier: f64) -> f64 {
    vwap - direction.sign() * multiplier * atr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stop,
    Vwap,
}

impl From<ExitReason> for OrderReason {
    fn from(reason: ExitReason) -> Self {
        match reason {
            ExitReason::Stop => OrderReason::ExitStop,
            ExitReason::Vwap => OrderReason::ExitVwap,
        }
    }
}

/// Exit rule: stop breached on any bar, or close on the wrong side of VWAP
/// at a boundary bar.
pub fn exit_signal(trade: &OpenTrade, close: f64, vwap: f64, boundary: bool) -> Option<ExitReason> {
    let stopped = match (trade.direction, trade.stop) {
        (Direction::Long, Some(stop)) => close <= stop,
        (Direction::Short, Some(stop)) => close >= stop,
        (_, None) => false,
    };
    if stopped {
        return Some(ExitReason::Stop);
    }
    let below_vwap = match trade.direction {
        Direction::Long => close < vwap,
        Direction::Short => close > vwap,
    };
    (boundary && below_vwap).then_some(ExitReason::Vwap)
}

/// Entry rule at boundary bars: close beyond the prior Donchian channel,
/// on the same side of VWAP, with the volatility filter passing.
pub fn entry_signal(snapshot: &IndicatorSnapshot, allow_shorts: bool) -> CoreResult<Option<Direction>> {
    let (upper, lower) = snapshot.require_donchian()?;
    snapshot.require_atr()?;
    let vwap = snapshot
        .vwap
        .ok_or(CoreError::IndicatorNotReady("vwap"))?;
    let filter = snapshot
        .volatility_filter_passes()
        .ok_or(CoreError::IndicatorNotReady("volatility"))?;

    if !is_boundary_bar(snapshot.timestamp) || !filter {
        return Ok(None);
    }

    let close = snapshot.close;
    if close > upper && close > vwap {
        Ok(Some(Direction::Long))
    } else if allow_shorts && close < lower && close < vwap {
        Ok(Some(Direction::Short))
    } else {
        Ok(None)
    }
}

/// Parameters the state machine reads from the config snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SignalParams {
    pub stop_multiplier: f64,
    pub allow_shorts: bool,
    pub volatility_trigger_enabled: bool,
    pub max_weekly_trades: u32,
}

impl From<&crate::config::StrategyConfig> for SignalParams {
    fn from(cfg: &crate::config::StrategyConfig) -> Self {
        Self {
            stop_multiplier: cfg.stop_multiplier,
            allow_shorts: cfg.allow_shorts,
            volatility_trigger_enabled: cfg.volatility_trigger_enabled,
            max_weekly_trades: cfg.max_weekly_trades,
        }
    }
}

/// What the live tracker wants this bar. Sizing and risk checks happen in
/// the engine; nothing here touches the live tracker directly.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveAction {
    Enter {
        direction: Direction,
        price: f64,
        atr: f64,
        stop: f64,
        /// The shadow tracker holds a trade in the same direction
        mirrors_shadow: bool,
    },
    Exit {
        reason: ExitReason,
        price: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalOutput {
    pub shadow_outcome: Option<TradeOutcome>,
    pub live: Option<LiveAction>,
}

/// Evaluate one instrument for the bar described by `snapshot`.
///
/// `eligible` is the instrument's standing in the ranking snapshotted at
/// bar start. Returns `MissingBarData` when VWAP is undefined (zero-volume
/// bar) and `IndicatorNotReady` while warming up with nothing open.
pub fn evaluate(
    state: &mut InstrumentState,
    snapshot: &IndicatorSnapshot,
    params: &SignalParams,
    eligible: bool,
) -> CoreResult<SignalOutput> {
    let vwap = snapshot
        .vwap
        .ok_or_else(|| CoreError::MissingBarData(state.symbol.to_string()))?;
    let close = snapshot.close;
    let ts = snapshot.timestamp;
    let boundary = is_boundary_bar(ts);
    let mut output = SignalOutput::default();

    state.volatility_triggered = snapshot.volatility_expanding();
    if params.volatility_trigger_enabled && state.volatility_triggered {
        if let Some(atr) = snapshot.atr {
            if let Some(d) = state.shadow.direction() {
                state
                    .shadow
                    .tighten_stop(vwap_stop(d, vwap, atr, params.stop_multiplier));
            }
            if let Some(d) = state.live.direction() {
                state
                    .live
                    .tighten_stop(vwap_stop(d, vwap, atr, params.stop_multiplier));
            }
        }
    }

    // exits
    if let Some(trade) = state.shadow.open_trade() {
        if exit_signal(trade, close, vwap, boundary).is_some() {
            if let Some((_, outcome)) = state.shadow.close(close, ts) {
                output.shadow_outcome = outcome;
            }
        }
    }
    if state.pending.is_none() {
        if let Some(trade) = state.live.open_trade() {
            if let Some(reason) = exit_signal(trade, close, vwap, boundary) {
                output.live = Some(LiveAction::Exit {
                    reason,
                    price: close,
                });
            }
        }
    }

    // entries
    let shadow_flat = !state.shadow.is_open();
    let live_can_enter = !state.live.is_open()
        && state.pending.is_none()
        && state.position.is_flat()
        && output.live.is_none();
    if !shadow_flat && !live_can_enter {
        return Ok(output);
    }

    let signal = match entry_signal(snapshot, params.allow_shorts) {
        Ok(signal) => signal,
        Err(e) if state.shadow.is_open() || state.live.is_open() => {
            debug!(symbol = %state.symbol, error = %e, "entry check skipped");
            None
        }
        Err(e) => return Err(e),
    };
    let Some(direction) = signal else {
        return Ok(output);
    };
    let atr = snapshot.require_atr()?;
    let stop = initial_stop(direction, close, atr, params.stop_multiplier);

    if shadow_flat && state.live.direction() != Some(direction.opposite()) {
        state.shadow.enter(OpenTrade {
            direction,
            entry_price: close,
            atr_at_entry: atr,
            stop: Some(stop),
            opened_at: ts,
        });
    }

    if live_can_enter && state.shadow.direction() != Some(direction.opposite()) {
        if !eligible {
            debug!(symbol = %state.symbol, "live entry skipped: outside ranking");
        } else if state.weekly_trades >= params.max_weekly_trades {
            debug!(
                symbol = %state.symbol,
                trades = state.weekly_trades,
                "live entry skipped: weekly trade limit"
            );
        } else {
            let mirrors_shadow = state
                .shadow
                .open_trade()
                .is_some_and(|t| t.direction == direction);
            output.live = Some(LiveAction::Enter {
                direction,
                price: close,
                atr,
                stop,
                mirrors_shadow,
            });
        }
    }

    Ok(output)
}
