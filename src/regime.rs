//! Market regime seam
//!
//! The classifier itself lives outside the core. The engine asks for the
//! regime at most once per calendar day and falls back to `Unknown` (the
//! most conservative caps) whenever the source cannot answer.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::MarketRegime;

pub trait RegimeSource {
    fn regime(&mut self, date: NaiveDate) -> CoreResult<MarketRegime>;
}

/// Fixed regime
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRegime(pub MarketRegime);

impl RegimeSource for StaticRegime {
    fn regime(&mut self, _date: NaiveDate) -> CoreResult<MarketRegime> {
        Ok(self.0)
    }
}

/// Dated regime classifications; each applies until the next entry
#[derive(Debug, Clone, Default)]
pub struct RegimeSchedule {
    entries: BTreeMap<NaiveDate, MarketRegime>,
}

impl RegimeSchedule {
    pub fn new(entries: impl IntoIterator<Item = (NaiveDate, MarketRegime)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Load `date,regime` rows (`2024-01-01,bull`)
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open regime file {}", path.display()))?;
        let mut entries = BTreeMap::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.context("Failed to read regime row")?;
            let date = NaiveDate::parse_from_str(record.get(0).unwrap_or_default(), "%Y-%m-%d")
                .with_context(|| format!("Bad date on regime row {}", line + 1))?;
            let regime: MarketRegime = record
                .get(1)
                .unwrap_or_default()
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Bad regime on row {}", line + 1))?;
            entries.insert(date, regime);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegimeSource for RegimeSchedule {
    fn regime(&mut self, date: NaiveDate) -> CoreResult<MarketRegime> {
        self.entries
            .range(..=date)
            .next_back()
            .map(|(_, r)| *r)
            .ok_or_else(|| CoreError::RegimeUnavailable(format!("no classification on or before {}", date)))
    }
}

/// Caches the regime per calendar day in front of a `RegimeSource`
pub struct DailyRegime {
    source: Box<dyn RegimeSource>,
    current: MarketRegime,
    refreshed_on: Option<NaiveDate>,
}

impl DailyRegime {
    pub fn new(source: Box<dyn RegimeSource>) -> Self {
        Self {
            source,
            current: MarketRegime::Unknown,
            refreshed_on: None,
        }
    }

    pub fn current(&self) -> MarketRegime {
        self.current
    }

    /// Regime for the bar at `ts`, querying the source on the first bar of a day
    pub fn refresh(&mut self, ts: DateTime<Utc>) -> MarketRegime {
        let today = ts.date_naive();
        if self.refreshed_on == Some(today) {
            return self.current;
        }
        self.refreshed_on = Some(today);
        self.current = match self.source.regime(today) {
            Ok(regime) => {
                info!(%today, %regime, "market regime refreshed");
                regime
            }
            Err(e) => {
                warn!(%today, error = %e, "regime unavailable, using unknown");
                MarketRegime::Unknown
            }
        };
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Counting {
        calls: std::rc::Rc<std::cell::Cell<usize>>,
    }

    impl RegimeSource for Counting {
        fn regime(&mut self, _date: NaiveDate) -> CoreResult<MarketRegime> {
            self.calls.set(self.calls.get() + 1);
            Ok(MarketRegime::Bull)
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn test_schedule_uses_latest_prior_entry() {
        let mut schedule = RegimeSchedule::new([
            (date(1), MarketRegime::Bull),
            (date(10), MarketRegime::Bear),
        ]);
        assert_eq!(schedule.regime(date(5)).unwrap(), MarketRegime::Bull);
        assert_eq!(schedule.regime(date(10)).unwrap(), MarketRegime::Bear);
        assert!(matches!(
            RegimeSchedule::default().regime(date(5)),
            Err(CoreError::RegimeUnavailable(_))
        ));
    }

    #[test]
    fn test_daily_cache_queries_once_per_day() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut daily = DailyRegime::new(Box::new(Counting {
            calls: calls.clone(),
        }));
        let t = Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap();
        assert_eq!(daily.refresh(t), MarketRegime::Bull);
        daily.refresh(t + chrono::Duration::hours(5));
        assert_eq!(calls.get(), 1);
        daily.refresh(t + chrono::Duration::days(1));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_unavailable_falls_back_to_unknown() {
        let mut daily = DailyRegime::new(Box::new(RegimeSchedule::new([(
            date(20),
            MarketRegime::Bear,
        )])));
        let t = Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap();
        assert_eq!(daily.refresh(t), MarketRegime::Unknown);
    }
}
