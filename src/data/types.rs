use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three observation feeds, ordered by resolution authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceId {
    /// METAR from the resolution station. Whole-degree precision, the only
    /// source allowed to raise the daily running max.
    Metar,
    /// SYNOP from the same station. 0.1°C precision, hourly. Trend and
    /// velocity context only.
    Synop,
    /// Open-Meteo model output. Frequent refresh, trend context and the
    /// daily/hourly forecast profile.
    OpenMeteo,
}

impl SourceId {
    /// Fallback order for trend/velocity when a higher-authority feed is out.
    pub const AUTHORITY: [SourceId; 3] = [SourceId::Metar, SourceId::Synop, SourceId::OpenMeteo];

    pub fn label(&self) -> &'static str {
        match self {
            SourceId::Metar => "METAR",
            SourceId::Synop => "SYNOP",
            SourceId::OpenMeteo => "OpenMeteo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Rising,
    Falling,
    Flat,
    Unknown,
}

/// A timestamped temperature point in local fractional hours (e.g. 14.5 =
/// 14:30 local). Local hours keep trend windows aligned with the forecast
/// hourly profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub hour: f64,
    pub temp_c: f64,
}

/// One normalized reading from one source. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub source: SourceId,
    pub observed_at: DateTime<Utc>,
    pub local_hour: f64,
    pub temp_c: f64,
}

/// One outcome range of the day's temperature event. Exactly one bracket
/// resolves YES at day end.
#[derive(Debug, Clone, PartialEq)]
pub struct Bracket {
    /// None for "X°C or below" brackets.
    pub floor: Option<f64>,
    /// None for "X°C or higher" brackets.
    pub ceiling: Option<f64>,
}

impl Bracket {
    pub fn exact(v: f64) -> Self {
        Bracket { floor: Some(v), ceiling: Some(v) }
    }

    pub fn at_most(v: f64) -> Self {
        Bracket { floor: None, ceiling: Some(v) }
    }

    pub fn at_least(v: f64) -> Self {
        Bracket { floor: Some(v), ceiling: None }
    }

    pub fn label(&self) -> String {
        match (self.floor, self.ceiling) {
            (None, Some(hi)) => format!("<={:.0}C", hi),
            (Some(lo), None) => format!(">={:.0}C", lo),
            (Some(lo), Some(hi)) if lo == hi => format!("{:.0}C", lo),
            (Some(lo), Some(hi)) => format!("{:.0}-{:.0}C", lo, hi),
            (None, None) => "?".to_string(),
        }
    }

    /// Whether a daily high rounded to the market's whole-degree resolution
    /// lands in this bracket.
    pub fn contains(&self, rounded_high: f64) -> bool {
        match (self.floor, self.ceiling) {
            (None, Some(hi)) => rounded_high <= hi,
            (Some(lo), None) => rounded_high >= lo,
            (Some(lo), Some(hi)) => rounded_high >= lo && rounded_high <= hi,
            (None, None) => false,
        }
    }

    /// Ascending-floor ordering key; open-ended lower brackets sort first.
    pub fn sort_key(&self) -> f64 {
        self.floor
            .or(self.ceiling.map(|c| c - 0.5))
            .unwrap_or(f64::NEG_INFINITY)
    }
}

/// Read snapshot of one bracket's market: definition plus live prices.
/// yes + no is close to 1.0 but deviation is tolerated, never enforced.
#[derive(Debug, Clone)]
pub struct BracketQuote {
    pub bracket: Bracket,
    pub question: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: f64,
    pub closed: bool,
    pub observed_at: DateTime<Utc>,
}

impl BracketQuote {
    /// NO price, falling back to the YES complement when the feed omits it.
    pub fn no_or_complement(&self) -> Option<f64> {
        self.no_price.or(self.yes_price.map(|y| 1.0 - y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_labels() {
        assert_eq!(Bracket::at_most(9.0).label(), "<=9C");
        assert_eq!(Bracket::at_least(17.0).label(), ">=17C");
        assert_eq!(Bracket::exact(14.0).label(), "14C");
    }

    #[test]
    fn test_bracket_contains_rounded_high() {
        assert!(Bracket::at_most(9.0).contains(9.0));
        assert!(!Bracket::at_most(9.0).contains(10.0));
        assert!(Bracket::at_least(17.0).contains(18.0));
        assert!(!Bracket::at_least(17.0).contains(16.0));
        assert!(Bracket::exact(14.0).contains(14.0));
        assert!(!Bracket::exact(14.0).contains(13.0));
    }

    #[test]
    fn test_sort_key_orders_ascending() {
        let mut brackets = vec![
            Bracket::at_least(17.0),
            Bracket::at_most(9.0),
            Bracket::exact(14.0),
            Bracket::exact(10.0),
        ];
        brackets.sort_by(|a, b| a.sort_key().partial_cmp(&b.sort_key()).unwrap());
        assert_eq!(brackets[0].label(), "<=9C");
        assert_eq!(brackets[1].label(), "10C");
        assert_eq!(brackets[2].label(), "14C");
        assert_eq!(brackets[3].label(), ">=17C");
    }

    #[test]
    fn test_no_or_complement() {
        let quote = BracketQuote {
            bracket: Bracket::exact(14.0),
            question: String::new(),
            yes_price: Some(0.30),
            no_price: None,
            volume: 0.0,
            closed: false,
            observed_at: Utc::now(),
        };
        assert!((quote.no_or_complement().unwrap() - 0.70).abs() < 1e-9);
    }
}
