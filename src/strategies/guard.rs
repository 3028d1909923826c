use crate::config::GuardConfig;
use crate::data::types::{Reading, SourceId, Trend};
use crate::strategies::types::{GuardDecision, GuardResult, Tier};
use tracing::info;

/// Everything the guard looks at for one candidate. Assembled by the caller
/// from the day's state at fire time; the guard itself fetches nothing and
/// never errors, a missing input trips the relevant predicate instead.
#[derive(Debug, Clone)]
pub struct GuardContext<'a> {
    pub local_hour: f64,
    pub running_max: Option<f64>,
    /// Floor of the bracket the candidate wants to kill.
    pub bracket_floor: Option<f64>,
    /// Best available forecast high (dynamic if present).
    pub forecast_high: Option<f64>,
    /// Raw model hourly profile for today.
    pub hourly_forecast: &'a [Reading],
    /// Additive correction to apply to hourly model temps (static bias plus
    /// any positive dynamic bias).
    pub hourly_correction: f64,
    /// Recent warming rate in °C over the lookback window, if measurable.
    pub velocity: Option<f64>,
    /// Current trend of every observation feed. One warming feed is enough
    /// to block, whatever the others say.
    pub trends: [(SourceId, Trend); 3],
    pub dynamic_bias_dangerous: bool,
}

/// Veto layer between detection and the ledger. Certainty-family tiers pass
/// through untouched; predictive candidates must clear every predicate. The
/// predicates are independent and OR-combined, and each trip contributes its
/// own reason string.
pub struct Guard {
    cfg: GuardConfig,
}

impl Guard {
    pub fn new(cfg: GuardConfig) -> Self {
        Self { cfg }
    }

    pub fn evaluate(&self, tier: Tier, ctx: &GuardContext) -> GuardResult {
        if tier != Tier::Predictive {
            return GuardResult::allow();
        }

        let mut reasons = Vec::new();

        // Forecast peak timing: if the model puts the day's peak after now,
        // the high is not in yet.
        match peak_of(ctx.hourly_forecast) {
            Some(peak) => {
                if peak.hour > ctx.local_hour {
                    reasons.push(format!(
                        "forecast peak {:.1}°C still ahead at {}:00",
                        peak.temp_c + ctx.hourly_correction,
                        peak.hour as u32
                    ));
                }
            }
            None => reasons.push("no hourly forecast for today".to_string()),
        }

        // Remaining hours must not project above the running max.
        match ctx.running_max {
            Some(running_max) => {
                let threat = ctx
                    .hourly_forecast
                    .iter()
                    .filter(|p| p.hour > ctx.local_hour)
                    .map(|p| p.temp_c + ctx.hourly_correction)
                    .find(|t| *t > running_max + self.cfg.remaining_tolerance);
                if let Some(t) = threat {
                    reasons.push(format!(
                        "remaining forecast reaches {:.1}°C, above running high {:.1}°C",
                        t, running_max
                    ));
                }
            }
            None => reasons.push("no ground-truth running high yet".to_string()),
        }

        // Corrected hourly max too close to the bracket floor.
        match (peak_of(ctx.hourly_forecast), ctx.bracket_floor) {
            (Some(peak), Some(floor)) => {
                let corrected = peak.temp_c + ctx.hourly_correction;
                if corrected >= floor - self.cfg.peak_margin {
                    reasons.push(format!(
                        "corrected hourly max {:.1}°C within {:.1}°C of floor {:.1}°C",
                        corrected, self.cfg.peak_margin, floor
                    ));
                }
            }
            (_, None) => reasons.push("no bracket floor to measure against".to_string()),
            _ => {}
        }

        // A rise on any feed blocks; Unknown does not (the timing and
        // velocity predicates already cover the no-data case).
        for (source, trend) in ctx.trends {
            if trend == Trend::Rising {
                reasons.push(format!("{} trend still rising", source.label()));
            }
        }

        // Warming too fast to call the day over.
        match ctx.velocity {
            Some(v) => {
                if v > self.cfg.velocity_ceiling {
                    reasons.push(format!(
                        "warming at {:+.1}°C exceeds ceiling {:+.1}°C over the window",
                        v, self.cfg.velocity_ceiling
                    ));
                }
            }
            None => reasons.push("cannot measure recent warming velocity".to_string()),
        }

        // Forecast high not plausibly reached yet.
        match (ctx.forecast_high, ctx.running_max) {
            (Some(high), Some(running_max)) => {
                if high - running_max > self.cfg.peak_margin {
                    reasons.push(format!(
                        "forecast high {:.1}°C not reached yet (running {:.1}°C)",
                        high, running_max
                    ));
                }
            }
            (None, _) => reasons.push("no forecast high available".to_string()),
            _ => {}
        }

        if ctx.dynamic_bias_dangerous {
            reasons.push("forecast model underforecasting beyond tolerance".to_string());
        }

        if reasons.is_empty() {
            GuardResult::allow()
        } else {
            info!("Guard BLOCK ({} reason(s)): {}", reasons.len(), reasons.join("; "));
            GuardResult {
                decision: GuardDecision::Block,
                reasons,
            }
        }
    }
}

fn peak_of(points: &[Reading]) -> Option<&Reading> {
    points
        .iter()
        .max_by(|a, b| a.temp_c.partial_cmp(&b.temp_c).unwrap_or(std::cmp::Ordering::Equal))
}
