//! Replay command implementation

use anyhow::Result;
use breakout_governor::audit::{OutcomeSource, SqliteOutcomeStore};
use breakout_governor::gateway::PaperGateway;
use breakout_governor::regime::{RegimeSchedule, StaticRegime};
use breakout_governor::{data, BarEngine, Config, MarketRegime};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ReplayTotals {
    bars: usize,
    intents: usize,
    fills: usize,
    rejections: usize,
    shadow_outcomes: usize,
    live_outcomes: usize,
    breaker_trips: usize,
    failures: usize,
    peak_equity: f64,
    max_drawdown: f64,
}

pub fn run(config_path: String, capital_override: Option<f64>, audit_db: Option<String>) -> Result<()> {
    info!("Starting replay");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: {:.2}", capital);
        config.trading.initial_capital = capital;
    }
    if let Some(path) = audit_db {
        info!("Overriding audit database to: {}", path);
        config.backtest.audit_db = Some(path);
    }

    info!("Loading data from: {}", config.backtest.data_dir);
    let symbols = config.symbols();
    debug!("Symbols: {:?}", symbols);
    let data = data::load_multi_symbol(&config.backtest.data_dir, &symbols, &config.backtest.timeframe)?;
    let timeline = data::group_by_timestamp(data);
    info!("Replaying {} bars", timeline.len());

    let initial_capital = config.trading.initial_capital;
    let regime_file = config.backtest.regime_file.clone();
    let audit_path = config.backtest.audit_db.clone();

    let mut engine = BarEngine::new(config, Box::new(PaperGateway::new()))?;

    engine = match regime_file {
        Some(path) => {
            let schedule = RegimeSchedule::from_csv(&path)?;
            info!("Loaded {} regime entries from {}", schedule.len(), path);
            engine.with_regime_source(Box::new(schedule))
        }
        None => engine.with_regime_source(Box::new(StaticRegime(MarketRegime::Unknown))),
    };

    if let Some(path) = audit_path {
        let store = SqliteOutcomeStore::open(&path)?;
        let records = store.load_all()?;
        let restored = engine.restore_outcomes(&records);
        info!("Restored {} outcomes from {}", restored, path);
        engine = engine.with_audit(Box::new(store));
    }

    let pb = ProgressBar::new(timeline.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")?
            .progress_chars("█░ "),
    );

    let mut totals = ReplayTotals {
        peak_equity: initial_capital,
        ..ReplayTotals::default()
    };

    for (ts, bars) in &timeline {
        let equity = engine.equity(initial_capital);
        let report = engine.on_bar(*ts, bars, equity)?;

        totals.bars += 1;
        totals.intents += report.submitted.len();
        totals.fills += report.fills;
        totals.rejections += report.rejections.len();
        totals.failures += report.failures.len();
        for record in &report.outcomes {
            match record.source {
                OutcomeSource::Shadow => totals.shadow_outcomes += 1,
                OutcomeSource::Live => totals.live_outcomes += 1,
            }
        }
        if report.breaker_tripped {
            totals.breaker_trips += 1;
            pb.set_message(format!("breaker tripped at {}", ts));
        }

        let marked = engine.equity(initial_capital);
        totals.peak_equity = totals.peak_equity.max(marked);
        if totals.peak_equity > 0.0 {
            let dd = (totals.peak_equity - marked) / totals.peak_equity * 100.0;
            totals.max_drawdown = totals.max_drawdown.max(dd);
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let final_equity = engine.equity(initial_capital);
    let total_return = if initial_capital > 0.0 {
        (final_equity - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    println!("\n{}", "=".repeat(60));
    println!("REPLAY RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    {:.2}", initial_capital);
    println!("Final Equity:       {:.2}", final_equity);
    println!("Total Return:       {:.2}%", total_return);
    println!("Max Drawdown:       {:.2}%", totals.max_drawdown);
    println!("Realized P&L:       {:.2}", engine.realized_pnl());
    println!("Bars:               {}", totals.bars);
    println!("Order Intents:      {}", totals.intents);
    println!("Fills:              {}", totals.fills);
    println!("Rejections:         {}", totals.rejections);
    println!("Shadow Outcomes:    {}", totals.shadow_outcomes);
    println!("Live Outcomes:      {}", totals.live_outcomes);
    println!("Breaker Trips:      {}", totals.breaker_trips);
    println!("Instrument Errors:  {}", totals.failures);
    println!("{}", "-".repeat(60));
    println!("{:<14} {:>8} {:>12} {:>10}", "Symbol", "Samples", "Expectancy", "SQN");

    let mode = engine.config().strategy.expectancy_mode;
    for state in engine.instruments() {
        let expectancy = state
            .window
            .expectancy_value(mode)
            .map(|e| format!("{:.3}", e))
            .unwrap_or_else(|| "-".into());
        let sqn = state
            .window
            .sqn()
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<14} {:>8} {:>12} {:>10}",
            state.symbol.as_str(),
            state.window.len(),
            expectancy,
            sqn
        );
    }
    println!("{}", "=".repeat(60));

    info!("Replay completed successfully");
    Ok(())
}
