//! Bar engine
//!
//! Owns the instrument arena and drives one pass per bar:
//!
//! ```text
//! reconcile fills -> refresh regime -> governor begin-bar
//!   -> per-instrument evaluation (ranking order from the previous bar)
//!   -> governor portfolio checks -> next bar's ranking -> governor end-bar
//! ```
//!
//! Each instrument is its own failure domain: an error evaluating one is
//! logged and the pass moves on. Portfolio checks run regardless.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::{MemoryOutcomeLog, OutcomeRecord, OutcomeSink, OutcomeSource};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::expectancy::{size_adjustment, ExpectancyMode, Ranking, TradeOutcome};
use crate::gateway::ExecutionGateway;
use crate::governor::{BreakerState, EntryDecision, GovernorConfig, PortfolioRiskGovernor, PositionView};
use crate::indicators::IndicatorParams;
use crate::instrument::{InstrumentState, PendingOrder, PlannedEntry};
use crate::notify::{LogNotifier, NoticeLevel, Notifier};
use crate::regime::{DailyRegime, RegimeSource, StaticRegime};
use crate::signal::{self, initial_stop, LiveAction, SignalParams};
use crate::sizing::{limit_price, PositionSizer, SizingRequest};
use crate::{
    Candle, Direction, ExecutionReport, ExecutionStatus, InstrumentId, MarketRegime, OrderId,
    OrderIntent, OrderReason, Side, Symbol,
};

/// Name-to-handle lookup, built once per universe definition
#[derive(Debug, Clone)]
pub struct Universe {
    symbols: Vec<Symbol>,
    index: HashMap<Symbol, InstrumentId>,
}

impl Universe {
    pub fn new(symbols: Vec<Symbol>) -> CoreResult<Self> {
        let mut index = HashMap::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            if index.insert(symbol.clone(), InstrumentId(i)).is_some() {
                return Err(CoreError::ConfigInvalid(format!(
                    "duplicate instrument {}",
                    symbol
                )));
            }
        }
        Ok(Self { symbols, index })
    }

    pub fn id(&self, symbol: &str) -> CoreResult<InstrumentId> {
        self.index
            .get(&Symbol::new(symbol))
            .copied()
            .ok_or_else(|| CoreError::UnknownInstrument(symbol.to_string()))
    }

    pub fn symbol(&self, id: InstrumentId) -> Option<&Symbol> {
        self.symbols.get(id.index())
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// An intent accepted by the gateway this bar
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub order_id: OrderId,
    pub intent: OrderIntent,
}

/// Everything that happened during one bar
#[derive(Debug, Clone, Default)]
pub struct BarReport {
    pub timestamp: Option<DateTime<Utc>>,
    pub regime: MarketRegime,
    pub fills: usize,
    pub submitted: Vec<SubmittedOrder>,
    pub rejections: Vec<String>,
    pub outcomes: Vec<OutcomeRecord>,
    pub skipped: usize,
    pub failures: Vec<(Symbol, CoreError)>,
    pub breaker_tripped: bool,
}

pub struct BarEngine {
    config: Arc<Config>,
    universe: Universe,
    instruments: Vec<InstrumentState>,
    signal_params: SignalParams,
    expectancy_mode: ExpectancyMode,
    sizer: PositionSizer,
    governor: PortfolioRiskGovernor,
    ranking: Ranking,
    regime: DailyRegime,
    gateway: Box<dyn ExecutionGateway>,
    audit: Box<dyn OutcomeSink>,
    notifier: Box<dyn Notifier>,
    next_sequence: u64,
    realized_pnl: f64,
    last_bar: Option<DateTime<Utc>>,
}

impl BarEngine {
    /// Build an engine over the configured universe. Regime defaults to
    /// `Unknown`, outcomes to an in-memory log, notices to the log.
    pub fn new(config: Config, gateway: Box<dyn ExecutionGateway>) -> CoreResult<Self> {
        config.validate()?;
        let universe = Universe::new(config.symbols())?;
        let params = IndicatorParams::from(&config.strategy);
        let instruments = config
            .trading
            .instruments
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                InstrumentState::new(
                    InstrumentId(i),
                    Symbol::new(&inst.symbol),
                    inst,
                    params.clone(),
                )
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let ranking = Ranking::build(&vec![None; instruments.len()], config.strategy.top_k);
        info!(
            instruments = instruments.len(),
            top_k = config.strategy.top_k,
            "bar engine initialized"
        );

        Ok(Self {
            signal_params: SignalParams::from(&config.strategy),
            expectancy_mode: config.strategy.expectancy_mode,
            sizer: PositionSizer::from_config(&config.risk),
            governor: GovernorConfig::from(&config.risk).build(),
            ranking,
            regime: DailyRegime::new(Box::new(StaticRegime(MarketRegime::Unknown))),
            gateway,
            audit: Box::new(MemoryOutcomeLog::new()),
            notifier: Box::new(LogNotifier),
            next_sequence: 1,
            realized_pnl: 0.0,
            last_bar: None,
            config: Arc::new(config),
            universe,
            instruments,
        })
    }

    pub fn with_regime_source(mut self, source: Box<dyn RegimeSource>) -> Self {
        self.regime = DailyRegime::new(source);
        self
    }

    pub fn with_audit(mut self, audit: Box<dyn OutcomeSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn instruments(&self) -> &[InstrumentState] {
        &self.instruments
    }

    pub fn instrument(&self, id: InstrumentId) -> CoreResult<&InstrumentState> {
        self.instruments
            .get(id.index())
            .ok_or_else(|| CoreError::UnknownInstrument(id.to_string()))
    }

    pub fn governor(&self) -> &PortfolioRiskGovernor {
        &self.governor
    }

    pub fn ranking(&self) -> &Ranking {
        &self.ranking
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.instruments.iter().map(InstrumentState::unrealized_pnl).sum()
    }

    /// Portfolio value marked at the last seen closes
    pub fn equity(&self, initial_capital: f64) -> f64 {
        initial_capital + self.realized_pnl + self.unrealized_pnl()
    }

    /// Expectancy per instrument in arena order
    pub fn expectancies(&self) -> Vec<Option<f64>> {
        self.instruments
            .iter()
            .map(|s| s.window.expectancy_value(self.expectancy_mode))
            .collect()
    }

    /// Seed the rolling windows from an audit trail after a restart.
    /// Returns the number of records applied.
    pub fn restore_outcomes(&mut self, records: &[OutcomeRecord]) -> usize {
        let mut ordered: Vec<&OutcomeRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.sequence);
        let mut applied = 0;
        for record in ordered {
            self.next_sequence = self.next_sequence.max(record.sequence + 1);
            match self.universe.id(&record.symbol) {
                Ok(id) => {
                    self.instruments[id.index()].window.push(record.outcome());
                    applied += 1;
                }
                Err(e) => debug!(error = %e, "outcome for instrument outside universe ignored"),
            }
        }
        self.refresh_size_adjustments();
        self.ranking = Ranking::build(&self.expectancies(), self.config.strategy.top_k);
        info!(applied, "rolling windows restored");
        applied
    }

    /// Swap in a new configuration. Only allowed on the first bar of a day
    /// and only when the universe and indicator periods are unchanged.
    pub fn reload_config(&mut self, config: Config, at: DateTime<Utc>) -> CoreResult<()> {
        if at.hour() != 0 || at.minute() != 0 {
            return Err(CoreError::ConfigInvalid(format!(
                "configuration may only be reloaded at a daily boundary, not {}",
                at
            )));
        }
        config.validate()?;
        if config.symbols() != self.universe.symbols() {
            return Err(CoreError::ConfigInvalid(
                "reload cannot change the instrument universe".into(),
            ));
        }
        if IndicatorParams::from(&config.strategy) != IndicatorParams::from(&self.config.strategy) {
            return Err(CoreError::ConfigInvalid(
                "reload cannot change indicator periods".into(),
            ));
        }

        self.signal_params = SignalParams::from(&config.strategy);
        self.expectancy_mode = config.strategy.expectancy_mode;
        self.sizer = PositionSizer::from_config(&config.risk);
        self.governor.reconfigure(GovernorConfig::from(&config.risk));
        self.config = Arc::new(config);
        info!(%at, "configuration reloaded");
        Ok(())
    }

    /// Run one bar. `bars` may omit instruments that did not trade.
    pub fn on_bar(
        &mut self,
        ts: DateTime<Utc>,
        bars: &HashMap<Symbol, Candle>,
        portfolio_value: f64,
    ) -> CoreResult<BarReport> {
        if let Some(last) = self.last_bar {
            if ts <= last {
                return Err(CoreError::DuplicateBar { at: ts, last });
            }
        }

        let mut report = BarReport {
            timestamp: Some(ts),
            ..BarReport::default()
        };

        for execution in self.gateway.drain_reports() {
            self.reconcile(&execution, ts, &mut report);
        }

        let regime = self.regime.refresh(ts);
        self.governor.set_regime(regime);
        report.regime = regime;

        let views = self.position_views(portfolio_value);
        self.governor.begin_bar(ts, portfolio_value, &views);

        let order = self.ranking.order().to_vec();
        for id in order {
            let symbol = self.instruments[id.index()].symbol.clone();
            let candle = bars.get(&symbol);
            match self.process_instrument(id, candle, ts, portfolio_value, regime, &mut report) {
                Ok(()) => {}
                Err(e) if e.is_skip() => {
                    debug!(%symbol, reason = %e, "instrument skipped");
                    report.skipped += 1;
                }
                Err(e @ CoreError::DuplicateBar { .. }) => {
                    warn!(%symbol, error = %e, "bar ignored");
                    report.failures.push((symbol, e));
                }
                Err(e) => {
                    error!(%symbol, error = %e, "instrument evaluation failed");
                    report.failures.push((symbol, e));
                }
            }
        }

        let was_armed = self.governor.breaker_state() == BreakerState::Armed;
        let views = self.position_views(portfolio_value);
        let actions = self.governor.evaluate(ts, &views);
        if was_armed && self.governor.breaker_state() == BreakerState::Triggered {
            report.breaker_tripped = true;
            self.notifier.notify(
                NoticeLevel::Critical,
                &format!(
                    "drawdown breaker triggered at {}: {} position(s) closing",
                    ts,
                    actions.len()
                ),
            );
        }
        for action in actions {
            self.submit_reduction(
                action.instrument,
                action.quantity,
                action.reason,
                action.mark_price,
                ts,
                &mut report,
            );
        }

        self.ranking = Ranking::build(&self.expectancies(), self.config.strategy.top_k);
        self.governor.end_bar();
        self.last_bar = Some(ts);
        Ok(report)
    }

    fn process_instrument(
        &mut self,
        id: InstrumentId,
        candle: Option<&Candle>,
        ts: DateTime<Utc>,
        portfolio_value: f64,
        regime: MarketRegime,
        report: &mut BarReport,
    ) -> CoreResult<()> {
        let state = &mut self.instruments[id.index()];
        let candle = candle.ok_or_else(|| CoreError::MissingBarData(state.symbol.to_string()))?;

        state.roll_week(ts);
        let snapshot = state.indicators.update(candle)?;
        state.snapshot = Some(snapshot.clone());

        let eligible = self.ranking.is_eligible(id);
        let output = signal::evaluate(state, &snapshot, &self.signal_params, eligible)?;

        if let Some(outcome) = output.shadow_outcome {
            self.record_outcome(id, outcome, OutcomeSource::Shadow, report);
        }

        match output.live {
            Some(LiveAction::Exit { reason, price }) => {
                let quantity = -self.instruments[id.index()].position.quantity;
                self.submit_reduction(id, quantity, reason.into(), price, ts, report);
            }
            Some(LiveAction::Enter {
                direction,
                price,
                atr,
                stop,
                mirrors_shadow,
            }) => {
                let plan = PlannedEntry {
                    direction,
                    stop,
                    atr,
                    mirrors_shadow,
                    portfolio_value,
                };
                self.submit_entry(id, plan, price, regime, ts, report);
            }
            None => {}
        }
        Ok(())
    }

    fn submit_entry(
        &mut self,
        id: InstrumentId,
        mut plan: PlannedEntry,
        price: f64,
        regime: MarketRegime,
        ts: DateTime<Utc>,
        report: &mut BarReport,
    ) {
        let state = &self.instruments[id.index()];
        let request = SizingRequest {
            direction: plan.direction,
            price,
            atr: plan.atr,
            portfolio_value: plan.portfolio_value,
            size_adjustment: state.size_adjustment,
            regime,
            lot_size: state.lot_size,
            tick_size: state.tick_size,
        };
        let Some(sized) = self.sizer.size(&request) else {
            return;
        };

        let quantity = match self
            .governor
            .check_entry(sized.quantity, sized.limit_price, state.lot_size)
        {
            EntryDecision::Approved(q) | EntryDecision::Resized(q) => q,
            EntryDecision::Rejected => {
                info!(symbol = %state.symbol, "entry blocked by exposure cap");
                return;
            }
        };

        if sized.contrarian {
            plan.stop = initial_stop(sized.direction, price, plan.atr, self.signal_params.stop_multiplier);
            plan.mirrors_shadow = false;
        }
        plan.direction = sized.direction;

        let reason = match sized.direction {
            Direction::Long => OrderReason::EntryLong,
            Direction::Short => OrderReason::EntryShort,
        };
        let intent = OrderIntent {
            instrument: id,
            symbol: state.symbol.clone(),
            quantity,
            limit_price: Some(sized.limit_price),
            reason,
        };
        if self.submit(intent, Some(plan), ts, report) {
            self.governor.record_entry(quantity, sized.limit_price);
        }
    }

    /// Exit or partial reduction at a limit offset from `reference_price`
    fn submit_reduction(
        &mut self,
        id: InstrumentId,
        quantity: f64,
        reason: OrderReason,
        reference_price: f64,
        ts: DateTime<Utc>,
        report: &mut BarReport,
    ) {
        let state = &self.instruments[id.index()];
        if quantity == 0.0 || state.pending.is_some() {
            return;
        }
        let side = if quantity > 0.0 { Side::Buy } else { Side::Sell };
        let intent = OrderIntent {
            instrument: id,
            symbol: state.symbol.clone(),
            quantity,
            limit_price: Some(limit_price(
                reference_price,
                side,
                self.sizer.price_offset_bps,
                state.tick_size,
            )),
            reason,
        };
        self.submit(intent, None, ts, report);
    }

    /// Returns whether the gateway accepted the order
    fn submit(
        &mut self,
        intent: OrderIntent,
        entry: Option<PlannedEntry>,
        ts: DateTime<Utc>,
        report: &mut BarReport,
    ) -> bool {
        match self.gateway.submit(&intent) {
            Ok(order_id) => {
                let state = &mut self.instruments[intent.instrument.index()];
                if entry.is_some() {
                    state.weekly_trades += 1;
                }
                state.pending = Some(PendingOrder {
                    order_id,
                    reason: intent.reason,
                    quantity: intent.quantity,
                    limit_price: intent.limit_price,
                    submitted_at: ts,
                    entry,
                });
                info!(
                    symbol = %intent.symbol,
                    order_id,
                    quantity = intent.quantity,
                    limit = ?intent.limit_price,
                    reason = %intent.reason,
                    "order submitted"
                );
                report.submitted.push(SubmittedOrder { order_id, intent });
                true
            }
            Err(e) => {
                self.on_rejection(&intent.symbol, &e.to_string(), report);
                false
            }
        }
    }

    fn reconcile(&mut self, execution: &ExecutionReport, ts: DateTime<Utc>, report: &mut BarReport) {
        let Some(state) = self.instruments.get_mut(execution.instrument.index()) else {
            warn!(instrument = %execution.instrument, "execution report for unknown instrument");
            return;
        };
        let symbol = state.symbol.clone();
        let effect = state.apply_report(execution, ts);
        self.realized_pnl += effect.realized_pnl;

        if matches!(
            execution.status,
            ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled
        ) && execution.filled_quantity != 0.0
        {
            report.fills += 1;
        }
        if let Some(reason) = effect.rejected {
            self.on_rejection(&symbol, &reason, report);
        }
        if let Some(closed) = effect.closed {
            match closed.outcome {
                Some(outcome) if !closed.mirrors_shadow => {
                    self.record_outcome(execution.instrument, outcome, OutcomeSource::Live, report);
                }
                _ => debug!(%symbol, "live outcome already counted by shadow tracker"),
            }
        }
    }

    fn on_rejection(&mut self, symbol: &Symbol, reason: &str, report: &mut BarReport) {
        let err = CoreError::OrderRejected {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        };
        warn!(error = %err, "order rejected");
        self.notifier.notify(NoticeLevel::Warning, &err.to_string());
        report.rejections.push(err.to_string());
    }

    fn record_outcome(
        &mut self,
        id: InstrumentId,
        outcome: TradeOutcome,
        source: OutcomeSource,
        report: &mut BarReport,
    ) {
        let state = &mut self.instruments[id.index()];
        state.window.push(outcome);
        let record = OutcomeRecord {
            symbol: state.symbol.to_string(),
            sequence: self.next_sequence,
            normalized_return: outcome.value(),
            timestamp: outcome.timestamp(),
            source,
        };
        self.next_sequence += 1;
        info!(
            symbol = %record.symbol,
            outcome = record.normalized_return,
            source = record.source.as_str(),
            samples = state.window.len(),
            "trade outcome recorded"
        );
        if let Err(e) = self.audit.append(&record) {
            warn!(error = %e, "outcome kept in memory only");
        }
        report.outcomes.push(record);
        self.refresh_size_adjustments();
    }

    fn refresh_size_adjustments(&mut self) {
        let expectancies = self.expectancies();
        let peers: Vec<f64> = expectancies.iter().flatten().copied().collect();
        for (state, e) in self.instruments.iter_mut().zip(expectancies) {
            state.size_adjustment = size_adjustment(e, &peers);
        }
    }

    fn position_views(&self, portfolio_value: f64) -> Vec<PositionView> {
        self.instruments
            .iter()
            .filter(|s| !s.position.is_flat() || s.pending.is_some())
            .map(|s| {
                let mark = s.mark_price().unwrap_or(s.position.avg_price);
                let atr = s.snapshot.as_ref().and_then(|snap| snap.atr).unwrap_or(0.0);
                let pending_entry_notional = s
                    .pending
                    .as_ref()
                    .filter(|p| p.entry.is_some())
                    .map(|p| (p.quantity - s.position.quantity) * p.limit_price.unwrap_or(mark))
                    .unwrap_or(0.0);
                PositionView {
                    instrument: s.id,
                    symbol: s.symbol.clone(),
                    quantity: s.position.quantity,
                    avg_price: s.position.avg_price,
                    mark_price: mark,
                    expectancy: s.window.expectancy_value(self.expectancy_mode),
                    nominal_quantity: self.sizer.nominal_quantity(
                        s.size_adjustment,
                        portfolio_value,
                        atr,
                        s.lot_size,
                    ),
                    value_at_open: s.position.value_at_open,
                    has_pending: s.pending.is_some(),
                    pending_entry_notional,
                    lot_size: s.lot_size,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::gateway::PaperGateway;
    use chrono::{Duration, TimeZone};

    fn config() -> Config {
        let mut config = Config::default();
        config.trading.instruments = vec![
            InstrumentConfig::new("BTCUSDT"),
            InstrumentConfig::new("ETHUSDT"),
        ];
        config.strategy.donchian_period = 3;
        config.strategy.atr_period = 3;
        config.strategy.short_vol_window = 2;
        config.strategy.long_vol_window = 4;
        config
    }

    fn candle(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            datetime: ts,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 10.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_universe_lookup() {
        let universe = Universe::new(vec![Symbol::new("A"), Symbol::new("B")]).unwrap();
        assert_eq!(universe.id("B").unwrap(), InstrumentId(1));
        assert!(matches!(
            universe.id("C"),
            Err(CoreError::UnknownInstrument(_))
        ));
        assert!(Universe::new(vec![Symbol::new("A"), Symbol::new("A")]).is_err());
    }

    #[test]
    fn test_engine_rejects_stale_bar() {
        let mut engine = BarEngine::new(config(), Box::new(PaperGateway::new())).unwrap();
        let bars = HashMap::new();
        engine.on_bar(t0(), &bars, 100_000.0).unwrap();
        assert!(matches!(
            engine.on_bar(t0(), &bars, 100_000.0),
            Err(CoreError::DuplicateBar { .. })
        ));
    }

    #[test]
    fn test_missing_instrument_is_skipped() {
        let mut engine = BarEngine::new(config(), Box::new(PaperGateway::new())).unwrap();
        let mut bars = HashMap::new();
        bars.insert(Symbol::new("BTCUSDT"), candle(t0(), 100.0));
        let report = engine.on_bar(t0(), &bars, 100_000.0).unwrap();
        // BTC warming up, ETH absent
        assert_eq!(report.skipped, 2);
        assert!(report.failures.is_empty());
        let eth = engine.universe().id("ETHUSDT").unwrap();
        assert!(engine.instrument(eth).unwrap().snapshot.is_none());
    }

    #[test]
    fn test_reload_only_at_daily_boundary() {
        let mut engine = BarEngine::new(config(), Box::new(PaperGateway::new())).unwrap();
        let mut updated = config();
        updated.risk.risk_percent = 0.5;
        assert!(engine
            .reload_config(updated.clone(), t0() + Duration::hours(3))
            .is_err());
        engine.reload_config(updated, t0() + Duration::days(1)).unwrap();
        assert_eq!(engine.config().risk.risk_percent, 0.5);

        let mut reshaped = config();
        reshaped.strategy.donchian_period = 10;
        assert!(engine.reload_config(reshaped, t0() + Duration::days(2)).is_err());
    }

    #[test]
    fn test_restore_outcomes_defines_expectancy() {
        let mut engine = BarEngine::new(config(), Box::new(PaperGateway::new())).unwrap();
        let records: Vec<OutcomeRecord> = (0..12)
            .map(|i| OutcomeRecord {
                symbol: "ETHUSDT".into(),
                sequence: i + 1,
                normalized_return: if i % 3 == 0 { -1.0 } else { 2.0 },
                timestamp: t0(),
                source: OutcomeSource::Shadow,
            })
            .chain(std::iter::once(OutcomeRecord {
                symbol: "DOGEUSDT".into(),
                sequence: 40,
                normalized_return: 1.0,
                timestamp: t0(),
                source: OutcomeSource::Live,
            }))
            .collect();
        assert_eq!(engine.restore_outcomes(&records), 12);
        let eth = engine.universe().id("ETHUSDT").unwrap();
        assert!(engine.expectancies()[eth.index()].is_some());
        assert_eq!(engine.ranking().order()[0], eth);
    }
}
