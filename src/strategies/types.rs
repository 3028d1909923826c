use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Elimination rule families, in the order a bracket can be killed by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    /// Running high already passed the bracket. Pure observation, no
    /// forecast dependency, zero prediction risk.
    Certain,
    /// Morning forecast kill on lower brackets.
    Forecast,
    /// Morning forecast kill on open-ended upper brackets.
    Upper,
    /// Noon reassessment of lower brackets with the tighter buffer.
    Midday,
    /// Late-day ceiling kill. Evaluated for data collection; trades only
    /// when explicitly activated in config.
    Predictive,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Certain => "FLOOR_NO_CERTAIN",
            Tier::Forecast => "FLOOR_NO_FORECAST",
            Tier::Upper => "UPPER_NO_FORECAST",
            Tier::Midday => "MIDDAY_NO",
            Tier::Predictive => "CEILING_NO_PREDICTIVE",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Idempotency key: at most one signal per (day, bracket, tier).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalId {
    pub date: NaiveDate,
    pub bracket: String,
    pub tier: Tier,
}

impl SignalId {
    pub fn new(date: NaiveDate, bracket: &str, tier: Tier) -> Self {
        Self {
            date,
            bracket: bracket.to_string(),
            tier,
        }
    }

    /// Stable string form, also the ledger position id.
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.date, self.bracket, self.tier.label())
    }
}

/// A candidate trade decision: buy NO on a bracket the tier declared dead.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: SignalId,
    pub fired_at: DateTime<Utc>,
    /// Local fractional hour at fire time, used by the guard.
    pub fired_hour: f64,
    /// How far past the kill threshold the rule was (°C).
    pub gap: f64,
    pub yes_price: f64,
    /// NO price from the snapshot at fire time.
    pub entry_price: f64,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GuardDecision {
    Allow,
    Block,
}

/// Outcome of the guard for one signal. Attached to the signal's audit
/// record, never persisted on its own.
#[derive(Debug, Clone)]
pub struct GuardResult {
    pub decision: GuardDecision,
    pub reasons: Vec<String>,
}

impl GuardResult {
    pub fn allow() -> Self {
        Self {
            decision: GuardDecision::Allow,
            reasons: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.decision == GuardDecision::Block
    }
}
