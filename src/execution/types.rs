use chrono::{DateTime, NaiveDate, Utc};

/// Only NO positions are ever opened (every signal is an elimination), but
/// the side is stored explicitly so the ledger rows are self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Side::Yes),
            "NO" => Some(Side::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Loss,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "WIN",
            Outcome::Loss => "LOSS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WIN" => Some(Outcome::Win),
            "LOSS" => Some(Outcome::Loss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// One paper position. `id` is the signal key, so the database enforces the
/// one-signal-per-(day, bracket, tier) rule a second time.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub date: NaiveDate,
    pub bracket: String,
    pub bracket_floor: Option<f64>,
    pub bracket_ceiling: Option<f64>,
    pub tier: String,
    pub question: String,
    pub side: Side,
    /// NO price paid per share.
    pub entry_price: f64,
    pub shares: f64,
    /// Dollars committed (the fixed trade size).
    pub cost: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub pnl: Option<f64>,
    pub status: PositionStatus,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// One row of the balance audit trail.
#[derive(Debug, Clone)]
pub struct BalanceRecord {
    pub balance: f64,
    pub recorded_at: DateTime<Utc>,
    pub note: String,
}
