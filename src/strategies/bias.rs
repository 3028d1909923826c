use crate::data::types::Reading;

/// How close (in hours) a ground-truth reading must be to a forecast point
/// to pair them for the dynamic bias average.
const PAIRING_TOLERANCE_HOURS: f64 = 0.5;

/// Correction layer for the forecast source. The static bias is a fixed,
/// historically calibrated additive term; the dynamic bias is measured fresh
/// each morning against the ground-truth feed.
#[derive(Debug, Clone)]
pub struct BiasEstimator {
    static_bias: f64,
    danger_ceiling: f64,
}

impl BiasEstimator {
    pub fn new(static_bias: f64, danger_ceiling: f64) -> Self {
        Self {
            static_bias,
            danger_ceiling,
        }
    }

    /// Raw forecast plus the configured static correction.
    pub fn corrected_forecast(&self, raw_forecast: f64) -> f64 {
        raw_forecast + self.static_bias
    }

    /// Mean (ground truth − forecast) over morning pairs up to `up_to_hour`.
    /// Positive means the model is underforecasting (the day runs warmer
    /// than predicted). None until at least one pair exists.
    pub fn dynamic_bias(
        &self,
        ground_truth: &[Reading],
        hourly_forecast: &[Reading],
        up_to_hour: f64,
    ) -> Option<f64> {
        let mut diffs = Vec::new();
        for obs in ground_truth.iter().filter(|o| o.hour <= up_to_hour) {
            let paired = hourly_forecast
                .iter()
                .find(|p| (p.hour - obs.hour).abs() <= PAIRING_TOLERANCE_HOURS);
            if let Some(p) = paired {
                diffs.push(obs.temp_c - p.temp_c);
            }
        }
        if diffs.is_empty() {
            return None;
        }
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    }

    /// Best available forecast high: dynamic correction once the morning
    /// window has produced a bias, static correction before that. Only a
    /// warm bias is ever added on top of the raw forecast; a cold morning
    /// must not drag the estimate below the model's own number.
    pub fn dynamic_forecast(&self, raw_forecast: f64, dynamic_bias: Option<f64>) -> f64 {
        match dynamic_bias {
            Some(bias) => raw_forecast + bias.max(0.0),
            None => self.corrected_forecast(raw_forecast),
        }
    }

    /// Safety trip: the model is underforecasting by more than we trust.
    /// Consumed by the upper tier and the guard.
    pub fn dynamic_bias_dangerous(&self, dynamic_bias: Option<f64>) -> bool {
        dynamic_bias.map(|b| b > self.danger_ceiling).unwrap_or(false)
    }
}
