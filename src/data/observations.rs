use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::data::types::{Observation, Reading, SourceId, Trend};

/// Bound on each per-source sliding window. At the fastest cadence (Open-Meteo
/// every 5 minutes) this still covers more than a full trading day.
const MAX_WINDOW: usize = 288;

/// Plausible surface temperature range; anything outside is a decode error.
const TEMP_MIN_C: f64 = -60.0;
const TEMP_MAX_C: f64 = 60.0;

/// Trend window and thresholds, per the 3h lookback used for all sources.
const TREND_WINDOW_HOURS: f64 = 3.0;
const TREND_THRESHOLD: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum ObservationError {
    #[error("{0} reading is not a finite number")]
    NotFinite(&'static str),

    // Field deliberately not named `source`: thiserror would treat that as
    // the error's cause.
    #[error("{label} reading {temp_c}°C outside plausible range")]
    OutOfRange { label: &'static str, temp_c: f64 },
}

/// All mutable per-day tracking state. Created fresh at every day rollover,
/// mutated only by the aggregator and the bias estimator.
#[derive(Debug, Clone)]
pub struct DailyState {
    pub date: NaiveDate,
    /// Highest ground-truth reading so far. Monotonic non-decreasing; models
    /// what the market resolves against, so only METAR may raise it.
    pub running_max: Option<f64>,
    windows: HashMap<SourceId, Vec<Reading>>,
    last_seen: HashMap<SourceId, DateTime<Utc>>,
    /// Raw (uncorrected) Open-Meteo daily max, fetched once per day.
    pub forecast_high_raw: Option<f64>,
    /// Open-Meteo hourly profile for today, fetched once per day.
    pub hourly_forecast: Vec<Reading>,
    /// Mean (METAR - model) over the morning window. None until computed.
    pub dynamic_bias: Option<f64>,
    pub morning_done: bool,
    pub midday_done: bool,
    pub signals_fired: u32,
    pub signals_blocked: u32,
    pub trades_opened: u32,
}

impl DailyState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            running_max: None,
            windows: HashMap::new(),
            last_seen: HashMap::new(),
            forecast_high_raw: None,
            hourly_forecast: Vec::new(),
            dynamic_bias: None,
            morning_done: false,
            midday_done: false,
            signals_fired: 0,
            signals_blocked: 0,
            trades_opened: 0,
        }
    }

    pub fn readings(&self, source: SourceId) -> &[Reading] {
        self.windows.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Normalizes readings from the three feeds into a common record and owns the
/// day's running max, trend windows and staleness bookkeeping.
pub struct Aggregator {
    pub state: DailyState,
    staleness_bound: chrono::Duration,
}

impl Aggregator {
    pub fn new(date: NaiveDate, staleness_bound_minutes: i64) -> Self {
        Self {
            state: DailyState::new(date),
            staleness_bound: chrono::Duration::minutes(staleness_bound_minutes),
        }
    }

    /// Validate and normalize one raw reading. Rejects malformed data without
    /// touching state.
    pub fn ingest(
        &self,
        source: SourceId,
        raw_temp_c: f64,
        observed_at: DateTime<Utc>,
        local_hour: f64,
    ) -> Result<Observation, ObservationError> {
        if !raw_temp_c.is_finite() {
            return Err(ObservationError::NotFinite(source.label()));
        }
        if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&raw_temp_c) {
            return Err(ObservationError::OutOfRange {
                label: source.label(),
                temp_c: raw_temp_c,
            });
        }
        // SYNOP reports in 0.1°C steps, METAR in whole degrees; one decimal
        // is the common unit.
        let temp_c = (raw_temp_c * 10.0).round() / 10.0;
        Ok(Observation {
            source,
            observed_at,
            local_hour,
            temp_c,
        })
    }

    /// Record a normalized observation: window append, last-seen update, and
    /// (for the ground-truth source only) running max.
    pub fn record(&mut self, obs: &Observation) {
        let window = self.state.windows.entry(obs.source).or_default();
        // SYNOP repeats the last report between hourly updates; skip dupes.
        let duplicate = window
            .last()
            .map(|r| (r.hour - obs.local_hour).abs() < 0.01 && r.temp_c == obs.temp_c)
            .unwrap_or(false);
        if !duplicate {
            window.push(Reading {
                hour: obs.local_hour,
                temp_c: obs.temp_c,
            });
            if window.len() > MAX_WINDOW {
                window.remove(0);
            }
        }
        self.state.last_seen.insert(obs.source, obs.observed_at);

        if obs.source == SourceId::Metar {
            match self.state.running_max {
                Some(prev) if obs.temp_c > prev => {
                    info!("New daily high: {:.1}°C (was {:.1}°C)", obs.temp_c, prev);
                    self.state.running_max = Some(obs.temp_c);
                }
                None => self.state.running_max = Some(obs.temp_c),
                _ => {}
            }
        }
    }

    /// Swap in a fresh day, returning the finished day's state for the
    /// day-end summary.
    pub fn rollover(&mut self, new_date: NaiveDate) -> DailyState {
        info!(
            "New day ({}). Resetting daily high (was {:.1}°C).",
            new_date,
            self.state.running_max.unwrap_or(0.0)
        );
        std::mem::replace(&mut self.state, DailyState::new(new_date))
    }

    pub fn is_stale(&self, source: SourceId, now: DateTime<Utc>) -> bool {
        match self.state.last_seen.get(&source) {
            Some(seen) => now.signed_duration_since(*seen) > self.staleness_bound,
            None => true,
        }
    }

    /// Every source stale beyond the bound: the cycle is degraded and the
    /// predictive tier must not run.
    pub fn degraded(&self, now: DateTime<Utc>) -> bool {
        SourceId::AUTHORITY.iter().all(|s| self.is_stale(*s, now))
    }

    /// Trend of one source over the lookback window ending at `at_hour`.
    pub fn trend(&self, source: SourceId, at_hour: f64) -> Trend {
        trend_of(self.state.readings(source), at_hour)
    }

    /// Trend of every feed at once, in authority order. The guard wants all
    /// of them: one warming feed is a veto regardless of the others.
    pub fn source_trends(&self, at_hour: f64) -> [(SourceId, Trend); 3] {
        SourceId::AUTHORITY.map(|s| (s, self.trend(s, at_hour)))
    }

    /// Trend for a source, falling back down the authority chain when the
    /// preferred source has no usable window. Fallback never promotes a
    /// source to running-max authority.
    pub fn trend_with_fallback(&self, preferred: SourceId, at_hour: f64) -> (SourceId, Trend) {
        let start = SourceId::AUTHORITY
            .iter()
            .position(|s| *s == preferred)
            .unwrap_or(0);
        for source in &SourceId::AUTHORITY[start..] {
            let t = self.trend(*source, at_hour);
            if t != Trend::Unknown {
                if *source != preferred {
                    warn!(
                        "{} trend unavailable, using {} instead",
                        preferred.label(),
                        source.label()
                    );
                }
                return (*source, t);
            }
        }
        (preferred, Trend::Unknown)
    }

    /// Rate of change (Δ°C over the 3h window) from the most precise source,
    /// falling back to the model feed when SYNOP has no window.
    pub fn velocity(&self, at_hour: f64) -> Option<(SourceId, f64)> {
        for source in [SourceId::Synop, SourceId::OpenMeteo] {
            if let Some(v) = velocity_of(self.state.readings(source), at_hour) {
                return Some((source, v));
            }
        }
        None
    }
}

fn window_slice(readings: &[Reading], at_hour: f64) -> Vec<&Reading> {
    readings
        .iter()
        .filter(|r| r.hour >= at_hour - TREND_WINDOW_HOURS && r.hour <= at_hour)
        .collect()
}

fn trend_of(readings: &[Reading], at_hour: f64) -> Trend {
    let relevant = window_slice(readings, at_hour);
    if relevant.len() < 2 {
        return Trend::Unknown;
    }
    let delta = relevant[relevant.len() - 1].temp_c - relevant[0].temp_c;
    if delta > TREND_THRESHOLD {
        Trend::Rising
    } else if delta < -TREND_THRESHOLD {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

fn velocity_of(readings: &[Reading], at_hour: f64) -> Option<f64> {
    let relevant = window_slice(readings, at_hour);
    if relevant.len() < 2 {
        return None;
    }
    Some(relevant[relevant.len() - 1].temp_c - relevant[0].temp_c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn agg() -> Aggregator {
        Aggregator::new(NaiveDate::from_ymd_opt(2026, 2, 22).unwrap(), 45)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, hour, 0, 0).unwrap()
    }

    fn feed(agg: &mut Aggregator, source: SourceId, hour: f64, temp: f64) {
        let obs = agg
            .ingest(source, temp, at(hour as u32), hour)
            .expect("valid reading");
        agg.record(&obs);
    }

    #[test]
    fn test_running_max_monotonic() {
        let mut a = agg();
        for (h, t) in [(8.0, 7.0), (9.0, 9.0), (10.0, 8.0), (11.0, 12.0), (12.0, 11.0)] {
            feed(&mut a, SourceId::Metar, h, t);
        }
        assert_eq!(a.state.running_max, Some(12.0));
    }

    #[test]
    fn test_secondary_sources_never_raise_running_max() {
        let mut a = agg();
        feed(&mut a, SourceId::Metar, 9.0, 10.0);
        // Finer-precision feeds read higher but are not resolution authority
        feed(&mut a, SourceId::Synop, 9.5, 12.3);
        feed(&mut a, SourceId::OpenMeteo, 9.5, 13.1);
        assert_eq!(a.state.running_max, Some(10.0));
    }

    #[test]
    fn test_malformed_reading_rejected() {
        let a = agg();
        assert!(a.ingest(SourceId::Metar, f64::NAN, at(9), 9.0).is_err());
        assert!(a.ingest(SourceId::Synop, -80.0, at(9), 9.0).is_err());
        let err = a.ingest(SourceId::Synop, 99.0, at(9), 9.0).unwrap_err();
        assert_eq!(err.to_string(), "SYNOP reading 99°C outside plausible range");
        // State untouched by rejected readings
        assert_eq!(a.state.running_max, None);
    }

    #[test]
    fn test_trend_directions() {
        let mut a = agg();
        feed(&mut a, SourceId::Synop, 9.0, 8.0);
        feed(&mut a, SourceId::Synop, 10.0, 8.5);
        feed(&mut a, SourceId::Synop, 11.0, 9.0);
        assert_eq!(a.trend(SourceId::Synop, 11.0), Trend::Rising);

        feed(&mut a, SourceId::OpenMeteo, 14.0, 9.0);
        feed(&mut a, SourceId::OpenMeteo, 16.0, 8.2);
        assert_eq!(a.trend(SourceId::OpenMeteo, 16.0), Trend::Falling);

        feed(&mut a, SourceId::Metar, 10.0, 9.0);
        feed(&mut a, SourceId::Metar, 11.0, 9.1);
        assert_eq!(a.trend(SourceId::Metar, 11.0), Trend::Flat);

        // Single reading in window -> no trend
        assert_eq!(a.trend(SourceId::Synop, 20.0), Trend::Unknown);
    }

    #[test]
    fn test_source_trends_covers_every_feed() {
        let mut a = agg();
        // Only SYNOP has a usable window; the others report Unknown rather
        // than borrowing a neighbor's trend.
        feed(&mut a, SourceId::Synop, 10.0, 8.0);
        feed(&mut a, SourceId::Synop, 11.0, 9.0);
        let trends = a.source_trends(11.0);
        assert_eq!(trends[0], (SourceId::Metar, Trend::Unknown));
        assert_eq!(trends[1], (SourceId::Synop, Trend::Rising));
        assert_eq!(trends[2], (SourceId::OpenMeteo, Trend::Unknown));
    }

    #[test]
    fn test_trend_fallback_chain() {
        let mut a = agg();
        // No METAR window; SYNOP has one
        feed(&mut a, SourceId::Synop, 10.0, 8.0);
        feed(&mut a, SourceId::Synop, 11.0, 9.0);
        let (source, trend) = a.trend_with_fallback(SourceId::Metar, 11.0);
        assert_eq!(source, SourceId::Synop);
        assert_eq!(trend, Trend::Rising);
    }

    #[test]
    fn test_velocity_from_most_precise_source() {
        let mut a = agg();
        feed(&mut a, SourceId::Synop, 13.0, 10.1);
        feed(&mut a, SourceId::Synop, 16.0, 11.0);
        let (source, v) = a.velocity(16.0).unwrap();
        assert_eq!(source, SourceId::Synop);
        assert!((v - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_velocity_falls_back_to_model() {
        let mut a = agg();
        feed(&mut a, SourceId::OpenMeteo, 13.0, 10.0);
        feed(&mut a, SourceId::OpenMeteo, 15.0, 10.4);
        let (source, v) = a.velocity(15.0).unwrap();
        assert_eq!(source, SourceId::OpenMeteo);
        assert!((v - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_staleness_and_degraded() {
        let mut a = agg();
        assert!(a.is_stale(SourceId::Metar, at(9)));
        assert!(a.degraded(at(9)));

        feed(&mut a, SourceId::Metar, 9.0, 10.0);
        assert!(!a.is_stale(SourceId::Metar, at(9)));
        assert!(!a.degraded(at(9)));
        // 45 minute bound: 2 hours later the feed is stale again
        assert!(a.is_stale(SourceId::Metar, at(11)));
        assert!(a.degraded(at(11)));
    }

    #[test]
    fn test_rollover_resets_state() {
        let mut a = agg();
        feed(&mut a, SourceId::Metar, 9.0, 10.0);
        let finished = a.rollover(NaiveDate::from_ymd_opt(2026, 2, 23).unwrap());
        assert_eq!(finished.running_max, Some(10.0));
        assert_eq!(a.state.running_max, None);
        assert!(a.state.readings(SourceId::Metar).is_empty());
    }
}
