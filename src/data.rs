//! Data loading
//!
//! Loads OHLCV bars from CSV files (`{SYMBOL}_{timeframe}.csv`) and groups
//! them into per-timestamp slices for replay. Instruments missing at a
//! timestamp are simply absent from that slice; nothing is forward-filled.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

use crate::{Candle, Symbol};

/// Bars of every instrument that traded at one timestamp
pub type BarSlice = HashMap<Symbol, Candle>;

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // no timezone, assume UTC
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

fn parse_field(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f64> {
    record
        .get(idx)
        .with_context(|| format!("Missing {} column", name))?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", name))
}

/// Load OHLCV data from a CSV file, dropping rows that fail validation
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let datetime = parse_datetime(record.get(0).context("Missing datetime column")?)?;

        let candle = Candle {
            datetime,
            open: parse_field(&record, 1, "open")?,
            high: parse_field(&record, 2, "high")?,
            low: parse_field(&record, 3, "low")?,
            close: parse_field(&record, 4, "close")?,
            volume: parse_field(&record, 5, "volume")?,
        };

        match candle.validate() {
            Ok(()) => candles.push(candle),
            Err(e) => warn!(row = row_idx + 1, error = %e, "invalid candle dropped"),
        }
    }

    candles.sort_by_key(|c| c.datetime);
    candles.dedup_by_key(|c| c.datetime);
    Ok(candles)
}

/// Load data for multiple symbols in parallel
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
) -> Result<HashMap<Symbol, Vec<Candle>>> {
    let data_dir = data_dir.as_ref();
    let loaded: Vec<(Symbol, Vec<Candle>)> = symbols
        .par_iter()
        .filter_map(|symbol| {
            let path = data_dir.join(format!("{}_{}.csv", symbol.as_str(), timeframe));
            if !path.exists() {
                warn!("Data file not found: {}", path.display());
                return None;
            }
            Some(
                load_csv(&path)
                    .with_context(|| format!("Failed to load data for {}", symbol))
                    .map(|candles| (symbol.clone(), candles)),
            )
        })
        .collect::<Result<_>>()?;

    if loaded.is_empty() {
        anyhow::bail!("No data loaded for any symbol");
    }
    for (symbol, candles) in &loaded {
        info!("Loaded {} candles for {}", candles.len(), symbol);
    }
    Ok(loaded.into_iter().collect())
}

/// Regroup per-symbol series into time-ordered slices
pub fn group_by_timestamp(data: HashMap<Symbol, Vec<Candle>>) -> BTreeMap<DateTime<Utc>, BarSlice> {
    let mut timeline: BTreeMap<DateTime<Utc>, BarSlice> = BTreeMap::new();
    for (symbol, candles) in data {
        for candle in candles {
            timeline
                .entry(candle.datetime)
                .or_default()
                .insert(symbol.clone(), candle);
        }
    }
    timeline
}
