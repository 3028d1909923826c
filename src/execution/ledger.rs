use anyhow::{bail, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::data::types::Bracket;
use crate::execution::persistence::PositionStore;
use crate::execution::types::{Outcome, Position, PositionStatus, Side};
use crate::strategies::types::Signal;

/// Paper ledger: fixed-size NO entries against eliminated brackets, resolved
/// at day end against the rounded daily high. Cash accounting is exact:
/// opening deducts the full trade size, a win pays shares out at $1, a loss
/// pays nothing, so starting_balance + Σ pnl always equals the balance.
pub struct PaperLedger {
    store: PositionStore,
    balance: f64,
    trade_size: f64,
}

impl PaperLedger {
    /// Resumes from the last recorded balance if the database has one.
    pub fn new(store: PositionStore, starting_balance: f64, trade_size: f64) -> Result<Self> {
        let balance = match store.latest_balance()? {
            Some(b) => {
                info!("Resuming ledger at ${:.2} (from balance history)", b);
                b
            }
            None => {
                store.record_balance(starting_balance, "starting balance")?;
                info!("Fresh ledger at ${:.2}", starting_balance);
                starting_balance
            }
        };
        Ok(Self {
            store,
            balance,
            trade_size,
        })
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Open a NO position for a signal. Returns the existing position when
    /// the key is already in the book, so a replayed signal is harmless.
    pub fn open(&mut self, signal: &Signal, bracket: &Bracket, question: &str) -> Result<Position> {
        let id = signal.id.key();
        if let Some(existing) = self.store.position(&id)? {
            warn!("Position {} already in the book, not reopening", id);
            return Ok(existing);
        }

        let entry = signal.entry_price;
        if entry <= 0.0 || entry > 1.0 {
            bail!("Refusing to open {}: NO price {:.3} out of range", id, entry);
        }
        if self.balance < self.trade_size {
            bail!(
                "Refusing to open {}: balance ${:.2} below trade size ${:.2}",
                id,
                self.balance,
                self.trade_size
            );
        }

        let position = Position {
            id: id.clone(),
            date: signal.id.date,
            bracket: signal.id.bracket.clone(),
            bracket_floor: bracket.floor,
            bracket_ceiling: bracket.ceiling,
            tier: signal.id.tier.label().to_string(),
            question: question.to_string(),
            side: Side::No,
            entry_price: entry,
            shares: self.trade_size / entry,
            cost: self.trade_size,
            opened_at: signal.fired_at,
            closed_at: None,
            outcome: None,
            pnl: None,
            status: PositionStatus::Open,
        };

        // One transaction for the position and its balance row; the in-memory
        // balance moves only once both are durable.
        let new_balance = self.balance - self.trade_size;
        self.store
            .open_position(&position, new_balance, &format!("opened {}", id))?;
        self.balance = new_balance;
        info!(
            "OPENED {} NO @ {:.3} ({:.2} shares, ${:.2}) -> balance ${:.2}",
            id, entry, position.shares, self.trade_size, self.balance
        );
        Ok(position)
    }

    /// Resolve every open position for `date` against the rounded daily
    /// high. The bracket that contains the high loses (our NO was wrong);
    /// every other bracket's NO pays out at $1 per share. Re-resolving a day
    /// is a no-op because closed positions are not selected.
    pub fn resolve_day(&mut self, date: NaiveDate, rounded_high: f64) -> Result<Vec<Position>> {
        let open = self.store.open_positions_for_date(date)?;
        let mut closed = Vec::with_capacity(open.len());
        for pos in open {
            let bracket = Bracket {
                floor: pos.bracket_floor,
                ceiling: pos.bracket_ceiling,
            };
            let outcome = if bracket.contains(rounded_high) {
                Outcome::Loss
            } else {
                Outcome::Win
            };
            closed.push(self.close(pos, outcome, rounded_high)?);
        }
        Ok(closed)
    }

    fn close(&mut self, mut pos: Position, outcome: Outcome, rounded_high: f64) -> Result<Position> {
        // Win: every NO share pays $1. Loss: the stake is gone, exactly.
        let (payout, pnl) = match outcome {
            Outcome::Win => (pos.shares, pos.shares - pos.cost),
            Outcome::Loss => (0.0, -pos.cost),
        };
        self.balance += payout;
        let note = format!(
            "resolved {} {} (high {:.0}°C)",
            pos.id,
            outcome.as_str(),
            rounded_high
        );
        self.store
            .close_position(&pos.id, outcome, pnl, self.balance, &note)?;
        info!(
            "RESOLVED {} {}: pnl {:+.2} -> balance ${:.2}",
            pos.id,
            outcome.as_str(),
            pnl,
            self.balance
        );
        pos.status = PositionStatus::Closed;
        pos.outcome = Some(outcome);
        pos.pnl = Some(pnl);
        Ok(pos)
    }

    pub fn open_positions_for_date(&self, date: NaiveDate) -> Result<Vec<Position>> {
        self.store.open_positions_for_date(date)
    }
}
