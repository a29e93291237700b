//! Incremental per-bar indicators powered by the `ta` crate
//!
//! Every indicator here is a pure function of the bar history fed to it,
//! updated exactly once per bar:
//! - Donchian channel over the bars preceding the current one
//! - ATR as a simple moving average of true range
//! - Volume-weighted average price that resets at each ISO week
//! - Short/long standard deviation of the rate-of-change series

use chrono::{DateTime, Datelike, Utc};
use std::collections::VecDeque;
use ta::indicators::{Maximum, Minimum, SimpleMovingAverage, StandardDeviation};
use ta::Next;

use crate::config::StrategyConfig;
use crate::error::{CoreError, CoreResult};
use crate::Candle;

fn ta_param(name: &str, period: usize) -> impl FnOnce(ta::errors::TaError) -> CoreError + '_ {
    move |e| CoreError::ConfigInvalid(format!("{} period {} rejected: {:?}", name, period, e))
}

// =============================================================================
// True Range
// =============================================================================

/// True range of a bar; the first bar (no previous close) uses high - low
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        None => high - low,
    }
}

// =============================================================================
// Donchian Channel
// =============================================================================

/// Highest high / lowest low over the `period` bars before the current bar
#[derive(Debug, Clone)]
pub struct DonchianChannel {
    period: usize,
    highest: Maximum,
    lowest: Minimum,
    prior: Option<(f64, f64)>,
    count: usize,
}

impl DonchianChannel {
    pub fn new(period: usize) -> CoreResult<Self> {
        Ok(Self {
            period,
            highest: Maximum::new(period).map_err(ta_param("donchian", period))?,
            lowest: Minimum::new(period).map_err(ta_param("donchian", period))?,
            prior: None,
            count: 0,
        })
    }

    /// Returns the channel formed by the preceding bars, then absorbs this one
    pub fn next(&mut self, high: f64, low: f64) -> Option<(f64, f64)> {
        let channel = if self.count >= self.period {
            self.prior
        } else {
            None
        };
        self.prior = Some((self.highest.next(high), self.lowest.next(low)));
        self.count += 1;
        channel
    }
}

// =============================================================================
// Average True Range
// =============================================================================

/// Simple moving average of true range
#[derive(Debug, Clone)]
pub struct AverageTrueRange {
    period: usize,
    sma: SimpleMovingAverage,
    prev_close: Option<f64>,
    count: usize,
}

impl AverageTrueRange {
    pub fn new(period: usize) -> CoreResult<Self> {
        Ok(Self {
            period,
            sma: SimpleMovingAverage::new(period).map_err(ta_param("atr", period))?,
            prev_close: None,
            count: 0,
        })
    }

    pub fn next(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let tr = true_range(high, low, self.prev_close);
        self.prev_close = Some(close);
        let value = self.sma.next(tr);
        self.count += 1;
        (self.count >= self.period).then_some(value)
    }
}

// =============================================================================
// Weekly VWAP
// =============================================================================

/// Typical-price VWAP accumulated over the current ISO week.
///
/// On the first bar of a new week the reported value blends the fresh
/// average 50/50 with the last value of the previous week, so the level
/// does not jump at the reset.
#[derive(Debug, Clone, Default)]
pub struct WeeklyVwap {
    week: Option<(i32, u32)>,
    price_volume: f64,
    volume: f64,
    last_value: Option<f64>,
}

impl WeeklyVwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for zero-volume bars; the accumulator is left untouched
    pub fn next(&mut self, candle: &Candle) -> Option<f64> {
        if candle.volume <= 0.0 {
            return None;
        }

        let iso = candle.datetime.iso_week();
        let key = (iso.year(), iso.week());
        let reset = self.week.is_some_and(|w| w != key);
        if reset || self.week.is_none() {
            self.price_volume = 0.0;
            self.volume = 0.0;
            self.week = Some(key);
        }

        self.price_volume += candle.typical_price() * candle.volume;
        self.volume += candle.volume;
        let average = self.price_volume / self.volume;

        let value = match (reset, self.last_value) {
            (true, Some(previous)) => 0.5 * average + 0.5 * previous,
            _ => average,
        };
        self.last_value = Some(value);
        Some(value)
    }
}

// =============================================================================
// Volatility Ratio
// =============================================================================

/// Population standard deviation of the percent rate-of-change series over
/// a short and a long window.
#[derive(Debug, Clone)]
pub struct VolatilityRatio {
    roc_period: usize,
    short_window: usize,
    long_window: usize,
    closes: VecDeque<f64>,
    short: StandardDeviation,
    long: StandardDeviation,
    samples: usize,
}

impl VolatilityRatio {
    pub fn new(roc_period: usize, short_window: usize, long_window: usize) -> CoreResult<Self> {
        if roc_period == 0 {
            return Err(CoreError::ConfigInvalid("roc period must be positive".into()));
        }
        Ok(Self {
            roc_period,
            short_window,
            long_window,
            closes: VecDeque::with_capacity(roc_period + 1),
            short: StandardDeviation::new(short_window)
                .map_err(ta_param("short volatility", short_window))?,
            long: StandardDeviation::new(long_window)
                .map_err(ta_param("long volatility", long_window))?,
            samples: 0,
        })
    }

    /// Returns `(short, long)` once the long window is full
    pub fn next(&mut self, close: f64) -> Option<(f64, f64)> {
        self.closes.push_back(close);
        if self.closes.len() > self.roc_period + 1 {
            self.closes.pop_front();
        }
        if self.closes.len() <= self.roc_period {
            return None;
        }

        let base = self.closes[0];
        let roc = (close - base) / base * 100.0;
        let short = self.short.next(roc);
        let long = self.long.next(roc);
        self.samples += 1;

        (self.samples >= self.long_window && self.samples >= self.short_window)
            .then_some((short, long))
    }
}

// =============================================================================
// Per-instrument engine
// =============================================================================

/// Indicator periods, taken from the strategy section of the config
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub donchian_period: usize,
    pub atr_period: usize,
    pub roc_period: usize,
    pub short_vol_window: usize,
    pub long_vol_window: usize,
}

impl From<&StrategyConfig> for IndicatorParams {
    fn from(cfg: &StrategyConfig) -> Self {
        Self {
            donchian_period: cfg.donchian_period,
            atr_period: cfg.atr_period,
            roc_period: cfg.roc_period,
            short_vol_window: cfg.short_vol_window,
            long_vol_window: cfg.long_vol_window,
        }
    }
}

/// Indicator values as of one bar. Absent values are still warming up
/// (or, for VWAP, the bar had no volume).
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub donchian_upper: Option<f64>,
    pub donchian_lower: Option<f64>,
    pub atr: Option<f64>,
    pub vwap: Option<f64>,
    pub short_volatility: Option<f64>,
    pub long_volatility: Option<f64>,
}

impl IndicatorSnapshot {
    /// Entries are allowed only while short-term volatility is not above long-term
    pub fn volatility_filter_passes(&self) -> Option<bool> {
        match (self.short_volatility, self.long_volatility) {
            (Some(s), Some(l)) => Some(s <= l),
            _ => None,
        }
    }

    /// Short-term volatility strictly above long-term
    pub fn volatility_expanding(&self) -> bool {
        self.volatility_filter_passes() == Some(false)
    }

    pub fn require_atr(&self) -> CoreResult<f64> {
        self.atr
            .filter(|a| *a > 0.0)
            .ok_or(CoreError::IndicatorNotReady("atr"))
    }

    pub fn require_donchian(&self) -> CoreResult<(f64, f64)> {
        match (self.donchian_upper, self.donchian_lower) {
            (Some(u), Some(l)) => Ok((u, l)),
            _ => Err(CoreError::IndicatorNotReady("donchian")),
        }
    }
}

/// All indicators for one instrument
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    params: IndicatorParams,
    donchian: DonchianChannel,
    atr: AverageTrueRange,
    vwap: WeeklyVwap,
    volatility: VolatilityRatio,
    last_bar: Option<DateTime<Utc>>,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams) -> CoreResult<Self> {
        Ok(Self {
            donchian: DonchianChannel::new(params.donchian_period)?,
            atr: AverageTrueRange::new(params.atr_period)?,
            vwap: WeeklyVwap::new(),
            volatility: VolatilityRatio::new(
                params.roc_period,
                params.short_vol_window,
                params.long_vol_window,
            )?,
            last_bar: None,
            params,
        })
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn last_bar(&self) -> Option<DateTime<Utc>> {
        self.last_bar
    }

    /// Apply one bar. Bars must arrive in strictly increasing time order;
    /// a repeated or stale bar is refused without touching any state.
    pub fn update(&mut self, candle: &Candle) -> CoreResult<IndicatorSnapshot> {
        if let Some(last) = self.last_bar {
            if candle.datetime <= last {
                return Err(CoreError::DuplicateBar {
                    at: candle.datetime,
                    last,
                });
            }
        }
        self.last_bar = Some(candle.datetime);

        let channel = self.donchian.next(candle.high, candle.low);
        let atr = self.atr.next(candle.high, candle.low, candle.close);
        let vwap = self.vwap.next(candle);
        let volatility = self.volatility.next(candle.close);

        Ok(IndicatorSnapshot {
            timestamp: candle.datetime,
            close: candle.close,
            donchian_upper: channel.map(|c| c.0),
            donchian_lower: channel.map(|c| c.1),
            atr,
            vwap,
            short_volatility: volatility.map(|v| v.0),
            long_volatility: volatility.map(|v| v.1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn bar(dt: DateTime<Utc>, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            datetime: dt,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_true_range() {
        assert_eq!(true_range(105.0, 95.0, None), 10.0);
        assert_eq!(true_range(105.0, 100.0, Some(90.0)), 15.0);
        assert_eq!(true_range(105.0, 100.0, Some(110.0)), 10.0);
    }

    #[test]
    fn test_donchian_excludes_current_bar() {
        let mut dc = DonchianChannel::new(3).unwrap();
        assert_eq!(dc.next(10.0, 5.0), None);
        assert_eq!(dc.next(12.0, 6.0), None);
        assert_eq!(dc.next(11.0, 4.0), None);
        // channel over the three prior bars, not including the 20.0 high
        assert_eq!(dc.next(20.0, 8.0), Some((12.0, 4.0)));
        // first bar has rolled out of the window
        assert_eq!(dc.next(9.0, 7.0), Some((20.0, 4.0)));
    }

    #[test]
    fn test_atr_is_sma_of_true_range() {
        let mut atr = AverageTrueRange::new(2).unwrap();
        assert_eq!(atr.next(11.0, 9.0, 10.0), None); // tr 2
        let v = atr.next(13.0, 10.0, 12.0).unwrap(); // tr 3
        assert_relative_eq!(v, 2.5);
        let v = atr.next(12.5, 11.5, 12.0).unwrap(); // tr 1
        assert_relative_eq!(v, 2.0);
    }

    #[test]
    fn test_vwap_zero_volume_leaves_accumulator() {
        let mut vwap = WeeklyVwap::new();
        let t = monday();
        let v1 = vwap.next(&bar(t, 11.0, 9.0, 10.0, 1.0)).unwrap();
        assert_relative_eq!(v1, 10.0);
        assert_eq!(vwap.next(&bar(t + Duration::hours(1), 30.0, 20.0, 25.0, 0.0)), None);
        let v3 = vwap
            .next(&bar(t + Duration::hours(2), 21.0, 19.0, 20.0, 1.0))
            .unwrap();
        assert_relative_eq!(v3, 15.0);
    }

    #[test]
    fn test_vwap_blends_on_week_reset() {
        let mut vwap = WeeklyVwap::new();
        let sunday = monday() + Duration::days(6) + Duration::hours(23);
        assert_relative_eq!(vwap.next(&bar(sunday, 10.0, 10.0, 10.0, 5.0)).unwrap(), 10.0);
        let next_monday = sunday + Duration::hours(1);
        let v = vwap
            .next(&bar(next_monday, 20.0, 20.0, 20.0, 1.0))
            .unwrap();
        assert_relative_eq!(v, 15.0);
        // second bar of the new week is the plain new-week average
        let v = vwap
            .next(&bar(next_monday + Duration::hours(1), 30.0, 30.0, 30.0, 1.0))
            .unwrap();
        assert_relative_eq!(v, 25.0);
    }

    #[test]
    fn test_volatility_ratio_population_stdev() {
        let mut vol = VolatilityRatio::new(1, 2, 3).unwrap();
        assert_eq!(vol.next(100.0), None);
        assert_eq!(vol.next(101.0), None); // roc 1%
        assert_eq!(vol.next(101.0), None); // roc 0%
        let (short, long) = vol.next(103.02).unwrap(); // roc 2%
        assert_relative_eq!(short, 1.0, epsilon = 1e-9);
        let expected_long = (2.0f64 / 3.0).sqrt();
        assert_relative_eq!(long, expected_long, epsilon = 1e-9);
    }

    #[test]
    fn test_engine_refuses_duplicate_bar() {
        let params = IndicatorParams {
            donchian_period: 2,
            atr_period: 2,
            roc_period: 1,
            short_vol_window: 2,
            long_vol_window: 2,
        };
        let mut engine = IndicatorEngine::new(params).unwrap();
        let t = monday();
        engine.update(&bar(t, 11.0, 9.0, 10.0, 1.0)).unwrap();
        let err = engine.update(&bar(t, 11.0, 9.0, 10.0, 1.0)).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateBar { .. }));
        assert_eq!(engine.last_bar(), Some(t));
    }

    #[test]
    fn test_engine_warm_up_and_filter() {
        let params = IndicatorParams {
            donchian_period: 2,
            atr_period: 2,
            roc_period: 1,
            short_vol_window: 2,
            long_vol_window: 3,
        };
        let mut engine = IndicatorEngine::new(params).unwrap();
        let t = monday();
        let closes = [100.0, 104.0, 100.0, 100.5, 100.0];
        let mut snap = None;
        for (i, c) in closes.iter().enumerate() {
            snap = Some(
                engine
                    .update(&bar(t + Duration::hours(i as i64), c + 0.5, c - 0.5, *c, 10.0))
                    .unwrap(),
            );
            if i < 3 {
                assert_eq!(snap.as_ref().unwrap().volatility_filter_passes(), None);
            }
        }
        let snap = snap.unwrap();
        assert!(snap.require_atr().is_ok());
        assert!(snap.require_donchian().is_ok());
        // calm tail after a 4% swing: short window below long window
        assert_eq!(snap.volatility_filter_passes(), Some(true));
        assert!(!snap.volatility_expanding());
    }

    #[test]
    fn test_invalid_period_is_config_error() {
        assert!(matches!(
            DonchianChannel::new(0),
            Err(CoreError::ConfigInvalid(_))
        ));
    }
}
