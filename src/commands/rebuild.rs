//! Rebuild command implementation

use anyhow::{anyhow, Result};
use breakout_governor::audit::{rebuild_windows, OutcomeSource, SqliteOutcomeStore};
use breakout_governor::expectancy::{ExpectancyMode, MIN_SAMPLES};
use tracing::info;

pub fn run(audit_db: String, mode: String) -> Result<()> {
    let mode: ExpectancyMode = mode.parse().map_err(|e: String| anyhow!(e))?;

    let store = SqliteOutcomeStore::open(&audit_db)?;
    let records = store.load_all()?;
    info!("Loaded {} outcome records from {}", records.len(), audit_db);

    let live = records.iter().filter(|r| r.source == OutcomeSource::Live).count();
    let windows = rebuild_windows(&records);

    println!("\n{}", "=".repeat(60));
    println!("ROLLING WINDOWS ({:?})", mode);
    println!("{}", "=".repeat(60));
    println!("Records:            {}", records.len());
    println!("Shadow / Live:      {} / {}", records.len() - live, live);
    println!("Instruments:        {}", windows.len());
    println!("{}", "-".repeat(60));
    println!("{:<14} {:>8} {:>12} {:>10}", "Symbol", "Samples", "Expectancy", "SQN");

    for (symbol, window) in &windows {
        let expectancy = match window.expectancy_value(mode) {
            Some(e) => format!("{:.3}", e),
            None => format!("<{} samples", MIN_SAMPLES),
        };
        let sqn = window
            .sqn()
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "-".into());
        println!("{:<14} {:>8} {:>12} {:>10}", symbol, window.len(), expectancy, sqn);
    }
    println!("{}", "=".repeat(60));

    Ok(())
}
