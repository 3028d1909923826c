use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::StationConfig;
use crate::data::types::Reading;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const SYNOP_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "temperature-bot/1.0";

#[derive(Debug, Deserialize)]
struct MetarReport {
    temp: Option<f64>,
    #[serde(rename = "rawOb")]
    #[serde(default)]
    raw_ob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrentResponse {
    current: OpenMeteoCurrent,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    temperature_2m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDailyResponse {
    daily: OpenMeteoDaily,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDaily {
    temperature_2m_max: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourlyResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
}

/// HTTP clients for the three observation feeds. Every fetch returns only a
/// freshly obtained value; on failure the caller gets `None` and the
/// aggregator's last-seen bookkeeping ages the source toward stale. Trend
/// and velocity keep working off the readings already in the windows.
pub struct WeatherSources {
    client: Client,
    station: StationConfig,
}

impl WeatherSources {
    pub fn new(station: StationConfig) -> Self {
        Self {
            client: Client::new(),
            station,
        }
    }

    /// Ground-truth reading: METAR at the resolution station. Whole-degree
    /// precision, roughly every 30 minutes. A `None` suppresses the
    /// continuous trigger for the cycle.
    pub async fn fetch_metar(&self) -> Option<f64> {
        let url = format!(
            "https://aviationweather.gov/api/data/metar?ids={}&format=json",
            self.station.metar_station
        );
        match self.get_metar(&url).await {
            Ok(Some(temp)) => Some(temp),
            Ok(None) => {
                warn!("METAR feed returned no usable report");
                None
            }
            Err(e) => {
                warn!("METAR error: {}", e);
                None
            }
        }
    }

    async fn get_metar(&self, url: &str) -> Result<Option<f64>> {
        let reports: Vec<MetarReport> = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .json()
            .await
            .context("Failed to parse METAR response")?;
        let first = match reports.into_iter().next() {
            Some(r) => r,
            None => return Ok(None),
        };
        if let Some(raw) = &first.raw_ob {
            tracing::debug!("METAR raw: {}", raw);
        }
        Ok(first.temp)
    }

    /// Secondary reading: SYNOP via OGIMET, 0.1°C precision, hourly. Returns
    /// (temp, report hour UTC).
    pub async fn fetch_synop(&self) -> Option<(f64, u32)> {
        let begin = Utc::now().format("%Y%m%d").to_string() + "0000";
        let url = format!(
            "https://www.ogimet.com/cgi-bin/getsynop?block={}&begin={}",
            self.station.synop_block, begin
        );
        match self.get_synop(&url).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("SYNOP error: {}", e);
                None
            }
        }
    }

    async fn get_synop(&self, url: &str) -> Result<Option<(f64, u32)>> {
        let text = self
            .client
            .get(url)
            .timeout(SYNOP_TIMEOUT)
            .send()
            .await?
            .text()
            .await?;

        let latest = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter(|l| l.starts_with(&self.station.synop_block))
            .last();
        let line = match latest {
            Some(l) => l,
            None => return Ok(None),
        };

        let temp = match decode_synop_temp(line) {
            Some(t) => t,
            None => return Ok(None),
        };
        // Line format: "07157,2026,02,22,14,00,AAXX ..."
        let hour_utc = line
            .split(',')
            .nth(4)
            .and_then(|h| h.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(Some((temp, hour_utc)))
    }

    /// Tertiary reading: Open-Meteo current temperature at the station grid
    /// point. Model output, reads a little cold, trend context only.
    pub async fn fetch_openmeteo_current(&self) -> Option<f64> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={}&longitude={}&current=temperature_2m",
            self.station.latitude, self.station.longitude
        );
        match self.get_json::<OpenMeteoCurrentResponse>(&url).await {
            Ok(resp) => resp.current.temperature_2m,
            Err(e) => {
                warn!("Open-Meteo error: {}", e);
                None
            }
        }
    }

    /// Today's raw forecast max. Fetched once per day; the bias estimator
    /// applies the static/dynamic corrections.
    pub async fn fetch_forecast_high(&self) -> Option<f64> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={}&longitude={}&daily=temperature_2m_max&forecast_days=1",
            self.station.latitude, self.station.longitude
        );
        match self.get_json::<OpenMeteoDailyResponse>(&url).await {
            Ok(resp) => resp.daily.temperature_2m_max.first().copied().flatten(),
            Err(e) => {
                warn!("Open-Meteo forecast error: {}", e);
                None
            }
        }
    }

    /// Today's hourly forecast profile, used by the upper tier and the guard.
    pub async fn fetch_hourly_profile(&self) -> Vec<Reading> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={}&longitude={}&hourly=temperature_2m&forecast_days=1",
            self.station.latitude, self.station.longitude
        );
        let resp = match self.get_json::<OpenMeteoHourlyResponse>(&url).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Open-Meteo hourly error: {}", e);
                return Vec::new();
            }
        };

        let points: Vec<Reading> = resp
            .hourly
            .time
            .iter()
            .zip(resp.hourly.temperature_2m.iter())
            .filter_map(|(t, temp)| {
                let temp = (*temp)?;
                let hour = parse_iso_hour(t)?;
                Some(Reading { hour, temp_c: temp })
            })
            .collect();

        if let Some(peak) = points
            .iter()
            .max_by(|a, b| a.temp_c.partial_cmp(&b.temp_c).unwrap())
        {
            info!(
                "Hourly forecast loaded: {} points, max={:.1}°C at {}:00",
                points.len(),
                peak.temp_c,
                peak.hour as u32
            );
        }
        points
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .json::<T>()
            .await
            .context("Failed to parse response")
    }
}

/// Extract the 0.1°C air temperature from the SYNOP 1snTTT group.
pub fn decode_synop_temp(raw_line: &str) -> Option<f64> {
    let re = Regex::new(r"\b1([01])(\d{3})\b").ok()?;
    let caps = re.captures(raw_line)?;
    let sign = if &caps[1] == "0" { 1.0 } else { -1.0 };
    let ttt: f64 = caps[2].parse().ok()?;
    Some(sign * ttt / 10.0)
}

/// Fractional local hour from an ISO timestamp like "2026-02-22T14:30".
fn parse_iso_hour(iso: &str) -> Option<f64> {
    let time_part = iso.split('T').nth(1)?;
    let mut parts = time_part.split(':');
    let hour: f64 = parts.next()?.parse().ok()?;
    let minute: f64 = parts.next().unwrap_or("0").parse().ok()?;
    Some(hour + minute / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_synop_temp() {
        // Positive: 1snTTT with sn=0 -> +11.2°C
        let line = "07157,2026,02,22,14,00,AAXX 22144 07157 42960 71208 10112 20081";
        assert_eq!(decode_synop_temp(line), Some(11.2));

        // Negative: sn=1 -> -3.4°C
        let line = "07157,2026,02,22,06,00,AAXX 22064 07157 42960 71208 11034 20081";
        assert_eq!(decode_synop_temp(line), Some(-3.4));

        assert_eq!(decode_synop_temp("no temperature group here"), None);
    }

    #[test]
    fn test_parse_iso_hour() {
        assert_eq!(parse_iso_hour("2026-02-22T14:00"), Some(14.0));
        assert_eq!(parse_iso_hour("2026-02-22T09:30"), Some(9.5));
        assert_eq!(parse_iso_hour("garbage"), None);
    }
}
