// Outcome audit trail
// Append-only record of every trade outcome fed to a rolling window.
//
// The in-memory windows are authoritative while trading; the store exists so
// windows can be rebuilt after a restart and inspected offline.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::expectancy::{RollingOutcomeWindow, TradeOutcome};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
    Shadow,
    Live,
}

impl OutcomeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeSource::Shadow => "shadow",
            OutcomeSource::Live => "live",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "shadow" => Some(OutcomeSource::Shadow),
            "live" => Some(OutcomeSource::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub symbol: String,
    pub sequence: u64,
    pub normalized_return: f64,
    pub timestamp: DateTime<Utc>,
    pub source: OutcomeSource,
}

impl OutcomeRecord {
    pub fn outcome(&self) -> TradeOutcome {
        TradeOutcome::new(self.normalized_return, self.timestamp)
    }
}

/// Destination for outcome records
pub trait OutcomeSink {
    fn append(&mut self, record: &OutcomeRecord) -> CoreResult<()>;
}

/// Replay records in sequence order into one window per symbol
pub fn rebuild_windows(records: &[OutcomeRecord]) -> BTreeMap<String, RollingOutcomeWindow> {
    let mut ordered: Vec<&OutcomeRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.sequence);
    let mut windows: BTreeMap<String, RollingOutcomeWindow> = BTreeMap::new();
    for record in ordered {
        windows
            .entry(record.symbol.clone())
            .or_default()
            .push(record.outcome());
    }
    windows
}

// =============================================================================
// In-memory sink
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryOutcomeLog {
    records: Vec<OutcomeRecord>,
}

impl MemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[OutcomeRecord] {
        &self.records
    }
}

impl OutcomeSink for MemoryOutcomeLog {
    fn append(&mut self, record: &OutcomeRecord) -> CoreResult<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

// =============================================================================
// SQLite store
// =============================================================================

pub struct SqliteOutcomeStore {
    conn: Connection,
}

impl SqliteOutcomeStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self { conn };
        store.create_tables()?;
        info!(path = %db_path.display(), "outcome store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory().context("Failed to open in-memory database")?,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS trade_outcomes (
                    sequence INTEGER PRIMARY KEY,
                    symbol TEXT NOT NULL,
                    normalized_return REAL NOT NULL,
                    timestamp TEXT NOT NULL,
                    source TEXT NOT NULL
                )",
                [],
            )
            .context("Failed to create trade_outcomes table")?;
        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_outcomes_symbol ON trade_outcomes(symbol)",
                [],
            )
            .context("Failed to create outcome index")?;
        Ok(())
    }

    /// All records in sequence order
    pub fn load_all(&self) -> Result<Vec<OutcomeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence, symbol, normalized_return, timestamp, source
             FROM trade_outcomes ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (sequence, symbol, normalized_return, ts, source) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .with_context(|| format!("Bad timestamp in outcome {}", sequence))?
                .with_timezone(&Utc);
            let source = OutcomeSource::parse(&source)
                .with_context(|| format!("Bad source '{}' in outcome {}", source, sequence))?;
            records.push(OutcomeRecord {
                symbol,
                sequence: sequence as u64,
                normalized_return,
                timestamp,
                source,
            });
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM trade_outcomes", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl OutcomeSink for SqliteOutcomeStore {
    fn append(&mut self, record: &OutcomeRecord) -> CoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO trade_outcomes (sequence, symbol, normalized_return, timestamp, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.sequence as i64,
                    record.symbol,
                    record.normalized_return,
                    record.timestamp.to_rfc3339(),
                    record.source.as_str(),
                ],
            )
            .map_err(|e| CoreError::PersistenceWriteFailure(e.to_string()))?;
        debug!(symbol = %record.symbol, sequence = record.sequence, "outcome recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(symbol: &str, sequence: u64, value: f64) -> OutcomeRecord {
        OutcomeRecord {
            symbol: symbol.to_string(),
            sequence,
            normalized_return: value,
            timestamp: Utc.with_ymd_and_hms(2024, 4, 1, 8, 30, 0).unwrap(),
            source: OutcomeSource::Shadow,
        }
    }

    #[test]
    fn test_sqlite_append_and_load() {
        let mut store = SqliteOutcomeStore::in_memory().unwrap();
        store.append(&record("BTCUSDT", 2, -0.5)).unwrap();
        store.append(&record("ETHUSDT", 1, 1.5)).unwrap();
        assert_eq!(store.count().unwrap(), 2);

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].sequence, 1);
        assert_eq!(loaded[0].symbol, "ETHUSDT");
        assert_eq!(loaded[1], record("BTCUSDT", 2, -0.5));
    }

    #[test]
    fn test_duplicate_sequence_is_persistence_failure() {
        let mut store = SqliteOutcomeStore::in_memory().unwrap();
        store.append(&record("BTCUSDT", 1, 1.0)).unwrap();
        assert!(matches!(
            store.append(&record("BTCUSDT", 1, 1.0)),
            Err(CoreError::PersistenceWriteFailure(_))
        ));
    }

    #[test]
    fn test_rebuild_orders_by_sequence() {
        let records = vec![
            record("BTCUSDT", 3, 3.0),
            record("BTCUSDT", 1, 1.0),
            record("SOLUSDT", 2, 2.0),
        ];
        let windows = rebuild_windows(&records);
        let btc: Vec<f64> = windows["BTCUSDT"].iter().map(|o| o.value()).collect();
        assert_eq!(btc, vec![1.0, 3.0]);
        assert_eq!(windows["SOLUSDT"].len(), 1);
    }

    #[test]
    fn test_memory_log() {
        let mut log = MemoryOutcomeLog::new();
        log.append(&record("BTCUSDT", 1, 1.0)).unwrap();
        assert_eq!(log.records().len(), 1);
    }
}
