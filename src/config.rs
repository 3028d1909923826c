use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub market: MarketConfig,
    pub station: StationConfig,
    pub monitor: MonitorConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    pub trading: TradingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub database_path: String,
    pub event_log_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub gamma_base_url: String,
    pub city: String,
}

/// Observation station the market resolves against, plus the model grid point.
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub metar_station: String,
    pub synop_block: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Offset of the market's local timezone from UTC, in hours.
    pub utc_offset_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub poll_minutes_day: u64,
    pub poll_minutes_night: u64,
    /// Local hours bounding the daytime (fast) polling cadence.
    pub day_start_hour: u32,
    pub day_end_hour: u32,
    pub staleness_bound_minutes: i64,
    pub morning_trigger_hour: u32,
    pub midday_trigger_hour: u32,
    pub late_day_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Resolution rounds to the nearest whole degree; a ceiling bracket is
    /// dead once running_max >= ceiling + rounding_buffer.
    pub rounding_buffer: f64,
    pub forecast_kill_buffer: f64,
    pub midday_kill_buffer: f64,
    pub upper_kill_buffer: f64,
    /// Additive correction for the forecast source's systematic cold bias.
    pub static_bias: f64,
    /// Above this, the morning bias says the model is underforecasting.
    pub dynamic_bias_danger_ceiling: f64,
    /// YES price below this is too small an edge to trade.
    pub min_actionable_price: f64,
    /// Corrected hourly forecast max must stay this far below an upper
    /// bracket's floor for the upper tier to fire.
    pub safety_margin: f64,
    /// Late-day gap between an upper bracket's floor and the running max
    /// required by the predictive tier.
    pub ceiling_gap: f64,
    /// Persistent activation flag for the predictive tier. While false its
    /// candidates are evaluated and logged but never traded.
    #[serde(default)]
    pub predictive_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_remaining_tolerance")]
    pub remaining_tolerance: f64,
    #[serde(default = "default_velocity_ceiling")]
    pub velocity_ceiling: f64,
    #[serde(default = "default_peak_margin")]
    pub peak_margin: f64,
}

fn default_remaining_tolerance() -> f64 { 0.5 }
fn default_velocity_ceiling() -> f64 { 0.3 }
fn default_peak_margin() -> f64 { 0.5 }

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            remaining_tolerance: default_remaining_tolerance(),
            velocity_ceiling: default_velocity_ceiling(),
            peak_margin: default_peak_margin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    pub trade_size: f64,
    pub starting_balance: f64,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub config_path: String,
    pub city_override: Option<String>,
}

impl EnvConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            config_path: std::env::var("CONFIG_PATH")
                .unwrap_or_else(|_| "config.toml".to_string()),
            city_override: std::env::var("CITY").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [system]
        database_path = "positions.db"
        event_log_path = "weather_log.jsonl"

        [market]
        gamma_base_url = "https://gamma-api.polymarket.com"
        city = "paris"

        [station]
        metar_station = "LFPG"
        synop_block = "07157"
        latitude = 49.0097
        longitude = 2.5479
        utc_offset_hours = 1

        [monitor]
        poll_minutes_day = 5
        poll_minutes_night = 15
        day_start_hour = 6
        day_end_hour = 20
        staleness_bound_minutes = 45
        morning_trigger_hour = 9
        midday_trigger_hour = 12
        late_day_hour = 16

        [strategy]
        rounding_buffer = 0.5
        forecast_kill_buffer = 4.0
        midday_kill_buffer = 2.5
        upper_kill_buffer = 5.0
        static_bias = 1.0
        dynamic_bias_danger_ceiling = 1.0
        min_actionable_price = 0.01
        safety_margin = 1.0
        ceiling_gap = 2.0

        [trading]
        trade_size = 100.0
        starting_balance = 1000.0
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.market.city, "paris");
        assert_eq!(config.strategy.rounding_buffer, 0.5);
        assert!(!config.strategy.predictive_enabled);
        // [guard] omitted entirely -> defaults apply
        assert_eq!(config.guard.velocity_ceiling, 0.3);
    }
}
