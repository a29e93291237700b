//! Trade-quality statistics: rolling outcome windows, expectancy, SQN,
//! cross-sectional ranking and the size-adjustment multiplier.

use chrono::{DateTime, Utc};
use itertools::{Itertools, MinMaxResult};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use std::collections::VecDeque;

use crate::{Direction, InstrumentId};

/// Outcomes retained per instrument
pub const WINDOW_CAPACITY: usize = 100;
/// Samples required before expectancy is considered defined
pub const MIN_SAMPLES: usize = 10;
/// Reported expectancy while fewer than `MIN_SAMPLES` outcomes exist
pub const EXPECTANCY_UNDEFINED: f64 = -1.0;

pub const SIZE_ADJUSTMENT_FLOOR: f64 = 0.1;
pub const SIZE_ADJUSTMENT_CEILING: f64 = 2.0;
pub const SIZE_ADJUSTMENT_NEUTRAL: f64 = 1.0;

/// How wins and losses are averaged into expectancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectancyMode {
    #[default]
    Mean,
    Median,
}

impl std::str::FromStr for ExpectancyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(ExpectancyMode::Mean),
            "median" => Ok(ExpectancyMode::Median),
            other => Err(format!("unknown expectancy mode '{}'", other)),
        }
    }
}

/// ATR-normalized result of one closed trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    value: f64,
    timestamp: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// `(exit - entry) / atr_at_entry`, sign-flipped for shorts.
    /// `None` when the entry ATR cannot normalize.
    pub fn from_trade(
        direction: Direction,
        entry_price: f64,
        exit_price: f64,
        atr_at_entry: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        if !(atr_at_entry > 0.0) {
            return None;
        }
        let value = direction.sign() * (exit_price - entry_price) / atr_at_entry;
        value.is_finite().then(|| Self::new(value, timestamp))
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Bounded FIFO of recent outcomes for one instrument
#[derive(Debug, Clone)]
pub struct RollingOutcomeWindow {
    samples: VecDeque<TradeOutcome>,
    capacity: usize,
}

impl Default for RollingOutcomeWindow {
    fn default() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }
}

impl RollingOutcomeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an outcome, returning the evicted oldest one when full
    pub fn push(&mut self, outcome: TradeOutcome) -> Option<TradeOutcome> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(outcome);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeOutcome> {
        self.samples.iter()
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|o| o.value)
    }

    /// Expectancy once at least `MIN_SAMPLES` outcomes exist
    pub fn expectancy_value(&self, mode: ExpectancyMode) -> Option<f64> {
        let total = self.samples.len();
        if total < MIN_SAMPLES {
            return None;
        }

        let (wins, losses): (Vec<f64>, Vec<f64>) = self.values().partition(|v| *v > 0.0);
        let central = |xs: Vec<f64>| -> f64 {
            if xs.is_empty() {
                return 0.0;
            }
            match mode {
                ExpectancyMode::Mean => xs.iter().mean(),
                ExpectancyMode::Median => Data::new(xs).median(),
            }
        };

        let win_count = wins.len() as f64;
        let loss_count = losses.len() as f64;
        let expectancy =
            (central(wins) * win_count + central(losses) * loss_count) / total as f64;
        Some(expectancy)
    }

    /// Expectancy with the `EXPECTANCY_UNDEFINED` sentinel during warm-up
    pub fn expectancy(&self, mode: ExpectancyMode) -> f64 {
        self.expectancy_value(mode).unwrap_or(EXPECTANCY_UNDEFINED)
    }

    /// System quality number: sqrt(n) * mean / sample stdev
    pub fn sqn(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.values().mean();
        let sd = self.values().std_dev();
        if !(sd > 0.0) {
            return None;
        }
        Some((n as f64).sqrt() * mean / sd)
    }
}

/// Map an instrument's expectancy into [0.1, 2.0] relative to its peers.
///
/// `peers` holds every defined expectancy in the universe (including this
/// instrument's). Undefined expectancy, or peers that are all equal, give
/// the neutral multiplier.
pub fn size_adjustment(expectancy: Option<f64>, peers: &[f64]) -> f64 {
    let Some(e) = expectancy else {
        return SIZE_ADJUSTMENT_NEUTRAL;
    };
    let (min, max) = match peers.iter().copied().minmax_by_key(|v| OrderedFloat(*v)) {
        MinMaxResult::MinMax(min, max) => (min.min(e), max.max(e)),
        MinMaxResult::OneElement(_) | MinMaxResult::NoElements => {
            return SIZE_ADJUSTMENT_NEUTRAL
        }
    };
    let range = max - min;
    if !(range > 0.0) {
        return SIZE_ADJUSTMENT_NEUTRAL;
    }
    let normalized = (e - min) / range;
    if normalized > 0.0 {
        (SIZE_ADJUSTMENT_CEILING * normalized).clamp(SIZE_ADJUSTMENT_FLOOR, SIZE_ADJUSTMENT_CEILING)
    } else {
        SIZE_ADJUSTMENT_FLOOR
    }
}

/// Cross-sectional ordering of instruments by expectancy.
///
/// Built once per bar and consumed by the next bar, so evaluation order and
/// entry eligibility never change mid-pass.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    order: Vec<InstrumentId>,
    eligible: Vec<bool>,
    defined: usize,
}

impl Ranking {
    /// Rank instruments whose expectancy is defined by descending
    /// expectancy (ties broken by id), followed by undefined ones in id
    /// order. The best `top_k` defined instruments are eligible for new
    /// entries; while fewer than `top_k` are defined, undefined
    /// instruments are eligible too.
    pub fn build(expectancies: &[Option<f64>], top_k: usize) -> Self {
        let (defined, undefined): (Vec<_>, Vec<_>) = expectancies
            .iter()
            .enumerate()
            .map(|(i, e)| (InstrumentId(i), *e))
            .partition(|(_, e)| e.is_some());

        let ranked: Vec<InstrumentId> = defined
            .iter()
            .sorted_by_key(|(id, e)| (std::cmp::Reverse(OrderedFloat(e.unwrap_or(f64::MIN))), *id))
            .map(|(id, _)| *id)
            .collect();

        let mut eligible = vec![false; expectancies.len()];
        for id in ranked.iter().take(top_k) {
            eligible[id.index()] = true;
        }
        if ranked.len() < top_k {
            for (id, _) in &undefined {
                eligible[id.index()] = true;
            }
        }

        let defined_count = ranked.len();
        let order = ranked
            .into_iter()
            .chain(undefined.into_iter().map(|(id, _)| id))
            .collect();

        Self {
            order,
            eligible,
            defined: defined_count,
        }
    }

    /// Evaluation order for the bar this ranking applies to
    pub fn order(&self) -> &[InstrumentId] {
        &self.order
    }

    pub fn is_eligible(&self, id: InstrumentId) -> bool {
        self.eligible.get(id.index()).copied().unwrap_or(false)
    }

    pub fn defined_count(&self) -> usize {
        self.defined
    }

    pub fn position(&self, id: InstrumentId) -> Option<usize> {
        self.order.iter().position(|x| *x == id)
    }
}
