use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;

use crate::execution::types::Position;
use crate::strategies::types::{GuardResult, Signal};

/// Append-only JSONL audit trail. One object per line, every record stamped
/// with a UTC timestamp and a kind tag, so a day can be replayed after the
/// fact without the database.
pub struct EventLog {
    log_path: String,
}

impl EventLog {
    pub fn new(log_path: String) -> Self {
        Self { log_path }
    }

    fn append(&self, kind: &str, payload: Value) -> Result<()> {
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "data": payload,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", record)?;
        Ok(())
    }

    pub fn log_observation(
        &self,
        source: &str,
        local_hour: f64,
        temp_c: f64,
        running_max: Option<f64>,
    ) -> Result<()> {
        self.append(
            "observation",
            json!({
                "source": source,
                "local_hour": local_hour,
                "temp_c": temp_c,
                "running_max": running_max,
            }),
        )
    }

    /// Per-cycle market snapshot: bracket labels and YES prices.
    pub fn log_snapshot(&self, brackets: &[(String, Option<f64>)]) -> Result<()> {
        let board: Vec<Value> = brackets
            .iter()
            .map(|(label, yes)| json!({ "bracket": label, "yes": yes }))
            .collect();
        self.append("snapshot", json!({ "board": board }))
    }

    pub fn log_signal(&self, signal: &Signal, tradeable: bool, guard: Option<&GuardResult>) -> Result<()> {
        self.append(
            "signal",
            json!({
                "key": signal.id.key(),
                "tier": signal.id.tier.label(),
                "bracket": signal.id.bracket,
                "fired_hour": signal.fired_hour,
                "gap": signal.gap,
                "yes_price": signal.yes_price,
                "entry_price": signal.entry_price,
                "note": signal.note,
                "tradeable": tradeable,
                "guard": guard.map(|g| json!({
                    "decision": g.decision,
                    "reasons": g.reasons,
                })),
            }),
        )
    }

    pub fn log_blocked(&self, key: &str, reasons: &[String]) -> Result<()> {
        self.append("blocked", json!({ "key": key, "reasons": reasons }))
    }

    pub fn log_position(&self, position: &Position) -> Result<()> {
        self.append(
            "position",
            json!({
                "id": position.id,
                "bracket": position.bracket,
                "tier": position.tier,
                "side": position.side.as_str(),
                "entry_price": position.entry_price,
                "shares": position.shares,
                "cost": position.cost,
                "status": position.status.as_str(),
                "outcome": position.outcome.map(|o| o.as_str()),
                "pnl": position.pnl,
            }),
        )
    }

    pub fn log_summary(&self, payload: Value) -> Result<()> {
        self.append("summary", payload)
    }
}
