use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::data::types::{BracketQuote, Reading, Trend};
use crate::strategies::types::{Signal, SignalId, Tier};

/// Read-only snapshot of the day that every tier evaluates against. Built
/// once per trigger; tiers never see each other's emissions except through
/// the already-dead check.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub date: NaiveDate,
    pub now: DateTime<Utc>,
    pub local_hour: f64,
    pub running_max: Option<f64>,
    /// Forecast high with the static correction applied.
    pub corrected_forecast: Option<f64>,
    /// Forecast high with the morning dynamic correction applied.
    pub dynamic_forecast: Option<f64>,
    pub dynamic_bias: Option<f64>,
    pub dynamic_bias_dangerous: bool,
    pub hourly_forecast: &'a [Reading],
    pub forecast_trend: Trend,
}

/// A signal the engine wants traded. `tradeable` is false for dormant
/// predictive-tier candidates, which are evaluated and logged but must not
/// open a position until the activation flag is set.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub signal: Signal,
    pub tradeable: bool,
}

/// One tier-evaluation outcome worth surfacing.
#[derive(Debug, Clone)]
pub enum Detection {
    Candidate(Candidate),
    /// A tier's own safety check vetoed a rule that otherwise passed.
    Blocked { id: SignalId, reasons: Vec<String> },
}

/// Tiered elimination engine. Tracks, per day, which brackets are dead and
/// which (day, bracket, tier) signals have been committed.
pub struct DetectionEngine {
    cfg: StrategyConfig,
    /// Committed signal keys. A key lands here once its decision is final
    /// (traded, blocked, dormant-logged, or audit no-op), so a candidate
    /// whose ledger write failed is re-emitted next cycle.
    fired: HashSet<SignalId>,
    /// First tier that killed each bracket.
    dead: HashMap<String, Tier>,
}

impl DetectionEngine {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self {
            cfg,
            fired: HashSet::new(),
            dead: HashMap::new(),
        }
    }

    pub fn reset_for_day(&mut self) {
        self.fired.clear();
        self.dead.clear();
    }

    /// Seal a decision for this key; later evaluations of it are no-ops.
    pub fn commit(&mut self, id: &SignalId) {
        self.fired.insert(id.clone());
    }

    pub fn is_dead(&self, bracket_label: &str) -> bool {
        self.dead.contains_key(bracket_label)
    }

    /// Brackets killed so far today with the tier that killed each first.
    pub fn dead_brackets(&self) -> Vec<(String, Tier)> {
        let mut dead: Vec<(String, Tier)> =
            self.dead.iter().map(|(label, tier)| (label.clone(), *tier)).collect();
        dead.sort_by(|a, b| a.0.cmp(&b.0));
        dead
    }

    /// Continuous trigger: certainty tier on every fresh ground-truth
    /// observation. `running_max >= ceiling + rounding_buffer` kills the
    /// bracket outright.
    pub fn evaluate_certainty(&mut self, board: &[BracketQuote], ctx: &EvalContext) -> Vec<Detection> {
        let running_max = match ctx.running_max {
            Some(v) => v,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for quote in open_ascending(board) {
            let ceiling = match quote.bracket.ceiling {
                Some(c) => c,
                None => continue,
            };
            if running_max >= ceiling + self.cfg.rounding_buffer {
                let gap = running_max - ceiling;
                let note = format!(
                    "running high {:.1}°C passed {} (buffer {:.1}°C)",
                    running_max,
                    quote.bracket.label(),
                    self.cfg.rounding_buffer
                );
                if let Some(d) = self.emit(quote, Tier::Certain, gap, note, true, ctx) {
                    out.push(d);
                }
            }
        }
        out
    }

    /// Morning trigger, part one: forecast tier for lower (ceiling) brackets.
    pub fn evaluate_forecast(&mut self, board: &[BracketQuote], ctx: &EvalContext) -> Vec<Detection> {
        let forecast = match ctx.corrected_forecast {
            Some(f) => f,
            None => {
                debug!("Forecast tier skipped: no forecast high yet");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for quote in open_ascending(board) {
            let ceiling = match quote.bracket.ceiling {
                Some(c) => c,
                None => continue,
            };
            let gap = forecast - ceiling;
            if gap < self.cfg.forecast_kill_buffer {
                continue;
            }
            if ctx.forecast_trend == Trend::Falling {
                debug!(
                    "Forecast tier on {}: trend FALLING, not firing",
                    quote.bracket.label()
                );
                continue;
            }
            let note = format!(
                "forecast={:.1}°C, bracket_top={:.1}°C, gap={:.1}°C",
                forecast, ceiling, gap
            );
            if let Some(d) = self.emit(quote, Tier::Forecast, gap, note, true, ctx) {
                out.push(d);
            }
        }
        out
    }

    /// Morning trigger, part two: upper tier for open-ended upper brackets.
    /// Needs the gap, a trusted dynamic bias, and the hourly profile staying
    /// clear of the floor.
    pub fn evaluate_upper(&mut self, board: &[BracketQuote], ctx: &EvalContext) -> Vec<Detection> {
        let dyn_forecast = match ctx.dynamic_forecast {
            Some(f) => f,
            None => {
                debug!("Upper tier skipped: no dynamic forecast yet");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for quote in open_ascending(board) {
            let floor = match (quote.bracket.floor, quote.bracket.ceiling) {
                (Some(lo), None) => lo,
                _ => continue,
            };
            let gap = floor - dyn_forecast;
            if gap < self.cfg.upper_kill_buffer {
                continue;
            }

            let mut reasons = Vec::new();
            if ctx.dynamic_bias_dangerous {
                reasons.push(format!(
                    "model underforecasting ({:+.1}°C)",
                    ctx.dynamic_bias.unwrap_or(0.0)
                ));
            }
            if let Some(hourly_max) = hourly_max(ctx.hourly_forecast) {
                let adjusted =
                    hourly_max + self.cfg.static_bias + ctx.dynamic_bias.unwrap_or(0.0).max(0.0);
                if adjusted >= floor - self.cfg.safety_margin {
                    reasons.push(format!(
                        "adjusted hourly max {:.1}°C within {:.1}°C of bracket floor {:.1}°C",
                        adjusted, self.cfg.safety_margin, floor
                    ));
                }
            }
            if !reasons.is_empty() {
                let id = SignalId::new(ctx.date, &quote.bracket.label(), Tier::Upper);
                if !self.fired.contains(&id) {
                    out.push(Detection::Blocked { id, reasons });
                }
                continue;
            }

            let note = format!(
                "dyn_forecast={:.1}°C, bracket={:.1}°C, gap={:.1}°C, bias={:+.1}°C",
                dyn_forecast,
                floor,
                gap,
                ctx.dynamic_bias.unwrap_or(0.0)
            );
            if let Some(d) = self.emit(quote, Tier::Upper, gap, note, true, ctx) {
                out.push(d);
            }
        }
        out
    }

    /// Midday trigger: re-evaluate surviving lower brackets with the dynamic
    /// forecast and the tighter buffer. Runs whether or not the morning tier
    /// fired; it catches gaps that closed between the two buffers once the
    /// bias correction landed.
    pub fn evaluate_midday(&mut self, board: &[BracketQuote], ctx: &EvalContext) -> Vec<Detection> {
        let dyn_forecast = match ctx.dynamic_forecast {
            Some(f) => f,
            None => {
                debug!("Midday tier skipped: no dynamic forecast yet");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for quote in open_ascending(board) {
            let ceiling = match quote.bracket.ceiling {
                Some(c) => c,
                None => continue,
            };
            let gap = dyn_forecast - ceiling;
            if gap < self.cfg.midday_kill_buffer {
                continue;
            }
            let note = format!(
                "dyn_forecast={:.1}°C, bracket_top={:.1}°C, gap={:.1}°C",
                dyn_forecast, ceiling, gap
            );
            if let Some(d) = self.emit(quote, Tier::Midday, gap, note, true, ctx) {
                out.push(d);
            }
        }
        out
    }

    /// Late-day predictive tier on open-ended upper brackets. Always
    /// evaluated for data collection; candidates are tradeable only once the
    /// persistent activation flag is set, and every candidate still has to
    /// clear the guard.
    pub fn evaluate_predictive(
        &mut self,
        board: &[BracketQuote],
        ctx: &EvalContext,
        late_day_hour: u32,
    ) -> Vec<Detection> {
        if (ctx.local_hour as u32) < late_day_hour {
            return Vec::new();
        }
        let running_max = match ctx.running_max {
            Some(v) => v,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for quote in open_ascending(board) {
            let floor = match (quote.bracket.floor, quote.bracket.ceiling) {
                (Some(lo), None) => lo,
                _ => continue,
            };
            let gap = floor - running_max;
            if gap < self.cfg.ceiling_gap {
                continue;
            }
            let note = format!(
                "running high {:.1}°C, bracket floor {:.1}°C, gap={:.1}°C at {}:00",
                running_max, floor, gap, ctx.local_hour as u32
            );
            if let Some(d) = self.emit(
                quote,
                Tier::Predictive,
                gap,
                note,
                self.cfg.predictive_enabled,
                ctx,
            ) {
                out.push(d);
            }
        }
        out
    }

    /// Shared emission path: idempotency, first-kill bookkeeping, and the
    /// actionable-price check. The min-actionable-price rule is enforced for
    /// every tier; a candidate below it is never traded (see DESIGN.md on
    /// the source ambiguity).
    fn emit(
        &mut self,
        quote: &BracketQuote,
        tier: Tier,
        gap: f64,
        note: String,
        tradeable: bool,
        ctx: &EvalContext,
    ) -> Option<Detection> {
        let label = quote.bracket.label();
        let id = SignalId::new(ctx.date, &label, tier);
        if self.fired.contains(&id) {
            return None;
        }

        match self.dead.get(&label) {
            Some(first) if *first != tier => {
                // Audit trail only: the bracket is already dead via an
                // earlier tier, so this check cannot produce a trade.
                self.fired.insert(id.clone());
                info!(
                    "{}: {} rule passed but bracket already dead via {} (no-op)",
                    label,
                    tier.label(),
                    first.label()
                );
                return None;
            }
            Some(_) => {
                // Same tier re-passing before its commit: a retry after a
                // failed ledger write. Fall through and emit again.
            }
            None => {
                self.dead.insert(label.clone(), tier);
                info!("BRACKET KILLED: {} via {} ({})", label, tier.label(), note);
            }
        }

        let yes = quote.yes_price?;
        let entry = quote.no_or_complement()?;
        if yes <= self.cfg.min_actionable_price {
            debug!(
                "{}: {} passed but YES={:.3} below actionable minimum, skipping",
                label,
                tier.label(),
                yes
            );
            return None;
        }

        Some(Detection::Candidate(Candidate {
            signal: Signal {
                id,
                fired_at: ctx.now,
                fired_hour: ctx.local_hour,
                gap,
                yes_price: yes,
                entry_price: entry,
                note,
            },
            tradeable,
        }))
    }
}

/// Open quotes in deterministic ascending-floor order. Order has no effect
/// on outcomes, only on log and replay ordering.
fn open_ascending(board: &[BracketQuote]) -> Vec<&BracketQuote> {
    let mut quotes: Vec<&BracketQuote> = board.iter().filter(|q| !q.closed).collect();
    quotes.sort_by(|a, b| {
        a.bracket
            .sort_key()
            .partial_cmp(&b.bracket.sort_key())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    quotes
}

fn hourly_max(points: &[Reading]) -> Option<f64> {
    points
        .iter()
        .map(|p| p.temp_c)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::Bracket;
    use chrono::TimeZone;

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            rounding_buffer: 0.5,
            forecast_kill_buffer: 4.0,
            midday_kill_buffer: 2.5,
            upper_kill_buffer: 5.0,
            static_bias: 1.0,
            dynamic_bias_danger_ceiling: 1.0,
            min_actionable_price: 0.01,
            safety_margin: 1.0,
            ceiling_gap: 2.0,
            predictive_enabled: false,
        }
    }

    fn quote(bracket: Bracket, yes: f64) -> BracketQuote {
        BracketQuote {
            bracket,
            question: String::new(),
            yes_price: Some(yes),
            no_price: Some(1.0 - yes),
            volume: 1000.0,
            closed: false,
            observed_at: Utc::now(),
        }
    }

    fn ctx(hour: f64) -> EvalContext<'static> {
        EvalContext {
            date: NaiveDate::from_ymd_opt(2026, 2, 22).unwrap(),
            now: Utc.with_ymd_and_hms(2026, 2, 22, hour as u32, 0, 0).unwrap(),
            local_hour: hour,
            running_max: None,
            corrected_forecast: None,
            dynamic_forecast: None,
            dynamic_bias: None,
            dynamic_bias_dangerous: false,
            hourly_forecast: &[],
            forecast_trend: Trend::Flat,
        }
    }

    fn candidates(detections: Vec<Detection>) -> Vec<Candidate> {
        detections
            .into_iter()
            .filter_map(|d| match d {
                Detection::Candidate(c) => Some(c),
                Detection::Blocked { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_certainty_fires_past_buffer() {
        // running_max=14.0, ceiling=13.0, buffer=0.5 -> 14.0 >= 13.5
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(13.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(14.0);

        let out = candidates(engine.evaluate_certainty(&board, &c));
        assert_eq!(out.len(), 1);
        let sig = &out[0].signal;
        assert_eq!(sig.id.tier, Tier::Certain);
        assert_eq!(sig.id.bracket, "13C");
        assert!((sig.gap - 1.0).abs() < 1e-9);
        assert!((sig.entry_price - 0.95).abs() < 1e-9);
        assert!(out[0].tradeable);
    }

    #[test]
    fn test_certainty_respects_buffer_edge() {
        // 13.4 < 13.0 + 0.5 -> still alive
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(13.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(13.4);
        assert!(candidates(engine.evaluate_certainty(&board, &c)).is_empty());
    }

    #[test]
    fn test_signal_idempotent_after_commit() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(13.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(14.0);

        let out = candidates(engine.evaluate_certainty(&board, &c));
        assert_eq!(out.len(), 1);
        engine.commit(&out[0].signal.id);

        // Same inputs again: no second signal
        assert!(candidates(engine.evaluate_certainty(&board, &c)).is_empty());
    }

    #[test]
    fn test_uncommitted_candidate_reemitted() {
        // A failed ledger write leaves the key uncommitted; the next cycle
        // must offer the trade again.
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(13.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(14.0);

        assert_eq!(candidates(engine.evaluate_certainty(&board, &c)).len(), 1);
        assert_eq!(candidates(engine.evaluate_certainty(&board, &c)).len(), 1);
    }

    #[test]
    fn test_dead_bracket_other_tier_is_noop() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(10.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(11.0);
        c.corrected_forecast = Some(15.7);

        let out = candidates(engine.evaluate_certainty(&board, &c));
        assert_eq!(out.len(), 1);
        engine.commit(&out[0].signal.id);

        // Forecast rule also passes (15.7 - 10.0 >= 4.0) but the bracket is
        // already dead: audit no-op, no candidate, and only once.
        assert!(candidates(engine.evaluate_forecast(&board, &c)).is_empty());
        assert!(engine.evaluate_forecast(&board, &c).is_empty());
    }

    #[test]
    fn test_forecast_tier_buffer_boundary() {
        // corrected_forecast=15.7: ceiling 11.9 -> gap 3.8, no signal;
        // ceiling 10.9 -> gap 4.8, fires.
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![
            quote(Bracket::at_most(11.9), 0.10),
            quote(Bracket::at_most(10.9), 0.08),
        ];
        let mut c = ctx(9.0);
        c.corrected_forecast = Some(15.7);

        let out = candidates(engine.evaluate_forecast(&board, &c));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].signal.id.bracket, "<=11C");
        assert!((out[0].signal.gap - 4.8).abs() < 1e-9);
    }

    #[test]
    fn test_forecast_tier_blocked_by_falling_trend() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_most(10.0), 0.08)];
        let mut c = ctx(9.0);
        c.corrected_forecast = Some(15.7);
        c.forecast_trend = Trend::Falling;
        assert!(candidates(engine.evaluate_forecast(&board, &c)).is_empty());
    }

    #[test]
    fn test_min_actionable_price_enforced_for_every_tier() {
        let mut engine = DetectionEngine::new(cfg());
        // YES below the 1 cent minimum: killed but never traded
        let board = vec![quote(Bracket::exact(10.0), 0.005)];
        let mut c = ctx(11.0);
        c.running_max = Some(12.0);
        c.corrected_forecast = Some(16.0);

        assert!(candidates(engine.evaluate_certainty(&board, &c)).is_empty());
        assert!(engine.is_dead("10C"));
    }

    #[test]
    fn test_upper_tier_fires_with_trusted_bias() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_least(17.0), 0.04)];
        let mut c = ctx(9.5);
        c.dynamic_forecast = Some(11.5);
        c.dynamic_bias = Some(0.4);
        let hourly = vec![Reading { hour: 14.0, temp_c: 11.0 }];
        c.hourly_forecast = &hourly;

        // gap = 17.0 - 11.5 = 5.5 >= 5.0; adjusted hourly max =
        // 11.0 + 1.0 + 0.4 = 12.4 < 17.0 - 1.0
        let out = candidates(engine.evaluate_upper(&board, &c));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].signal.id.tier, Tier::Upper);
        assert!((out[0].signal.gap - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_upper_tier_blocked_by_dangerous_bias() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_least(17.0), 0.04)];
        let mut c = ctx(9.5);
        c.dynamic_forecast = Some(11.5);
        c.dynamic_bias = Some(1.6);
        c.dynamic_bias_dangerous = true;

        let out = engine.evaluate_upper(&board, &c);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Detection::Blocked { id, reasons } => {
                assert_eq!(id.tier, Tier::Upper);
                assert!(!reasons.is_empty());
            }
            Detection::Candidate(_) => panic!("expected block"),
        }
        assert!(!engine.is_dead(">=17C"));
    }

    #[test]
    fn test_upper_tier_blocked_by_hourly_profile_near_floor() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_least(17.0), 0.04)];
        let mut c = ctx(9.5);
        c.dynamic_forecast = Some(11.5);
        c.dynamic_bias = Some(0.0);
        // 15.5 + 1.0 static = 16.5 >= 17.0 - 1.0
        let hourly = vec![Reading { hour: 14.0, temp_c: 15.5 }];
        c.hourly_forecast = &hourly;

        let out = engine.evaluate_upper(&board, &c);
        assert!(matches!(out[0], Detection::Blocked { .. }));
    }

    #[test]
    fn test_midday_tier_uses_tighter_buffer() {
        let mut engine = DetectionEngine::new(cfg());
        // gap = 13.5 - 11.0 = 2.5 >= 2.5: fires even though the morning
        // 4.0°C buffer would not have
        let board = vec![quote(Bracket::at_most(11.0), 0.06)];
        let mut c = ctx(12.0);
        c.dynamic_forecast = Some(13.5);

        let out = candidates(engine.evaluate_midday(&board, &c));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].signal.id.tier, Tier::Midday);
    }

    #[test]
    fn test_predictive_tier_dormant_by_default() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_least(16.0), 0.05)];
        let mut c = ctx(16.5);
        c.running_max = Some(13.0);

        let out = candidates(engine.evaluate_predictive(&board, &c, 16));
        assert_eq!(out.len(), 1);
        assert!(!out[0].tradeable);
    }

    #[test]
    fn test_predictive_tier_activated_by_flag() {
        let mut config = cfg();
        config.predictive_enabled = true;
        let mut engine = DetectionEngine::new(config);
        let board = vec![quote(Bracket::at_least(16.0), 0.05)];
        let mut c = ctx(16.5);
        c.running_max = Some(13.0);

        let out = candidates(engine.evaluate_predictive(&board, &c, 16));
        assert_eq!(out.len(), 1);
        assert!(out[0].tradeable);
    }

    #[test]
    fn test_predictive_tier_waits_for_late_day() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::at_least(16.0), 0.05)];
        let mut c = ctx(14.0);
        c.running_max = Some(13.0);
        assert!(engine.evaluate_predictive(&board, &c, 16).is_empty());
    }

    #[test]
    fn test_evaluation_order_is_ascending_floor() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![
            quote(Bracket::exact(12.0), 0.05),
            quote(Bracket::at_most(9.0), 0.03),
            quote(Bracket::exact(11.0), 0.04),
        ];
        let mut c = ctx(13.0);
        c.running_max = Some(14.0);

        let out = candidates(engine.evaluate_certainty(&board, &c));
        let order: Vec<&str> = out.iter().map(|o| o.signal.id.bracket.as_str()).collect();
        assert_eq!(order, vec!["<=9C", "11C", "12C"]);
    }

    #[test]
    fn test_day_reset_clears_engine_state() {
        let mut engine = DetectionEngine::new(cfg());
        let board = vec![quote(Bracket::exact(13.0), 0.05)];
        let mut c = ctx(11.0);
        c.running_max = Some(14.0);
        let out = candidates(engine.evaluate_certainty(&board, &c));
        engine.commit(&out[0].signal.id);
        assert!(engine.is_dead("13C"));

        engine.reset_for_day();
        assert!(!engine.is_dead("13C"));
        assert_eq!(candidates(engine.evaluate_certainty(&board, &c)).len(), 1);
    }
}
