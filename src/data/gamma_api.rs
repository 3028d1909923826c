use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::data::types::{Bracket, BracketQuote};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GammaApiClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GammaEvent {
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
struct GammaMarket {
    #[serde(default)]
    question: Option<String>,
    /// Stringified JSON array: "[\"0.03\", \"0.97\"]"
    #[serde(rename = "outcomePrices")]
    #[serde(default)]
    outcome_prices: Option<serde_json::Value>,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    closed: bool,
}

impl GammaApiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    /// Fetch the day's temperature event and return one quote per bracket.
    /// Markets whose question cannot be parsed into a bracket are skipped.
    pub async fn fetch_bracket_board(&self, slug: &str) -> Result<Vec<BracketQuote>> {
        let url = format!("{}/events", self.base_url);

        let events: Vec<GammaEvent> = self
            .client
            .get(&url)
            .query(&[("slug", slug)])
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .context("Failed to fetch temperature event")?
            .json()
            .await
            .context("Failed to parse event response")?;

        let event = match events.into_iter().next() {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let observed_at = Utc::now();
        let board = event
            .markets
            .into_iter()
            .filter_map(|m| convert_market(m, observed_at))
            .collect();
        Ok(board)
    }
}

fn convert_market(m: GammaMarket, observed_at: chrono::DateTime<Utc>) -> Option<BracketQuote> {
    let question = m.question?;
    let bracket = extract_bracket(&question)?;
    let (yes_price, no_price) = parse_outcome_prices(m.outcome_prices.as_ref());
    let volume = m.volume.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
    Some(BracketQuote {
        bracket,
        question,
        yes_price,
        no_price,
        volume,
        closed: m.closed,
        observed_at,
    })
}

/// outcomePrices arrives either as a JSON array or as a stringified array.
fn parse_outcome_prices(value: Option<&serde_json::Value>) -> (Option<f64>, Option<f64>) {
    let parsed: Option<Vec<f64>> = match value {
        Some(serde_json::Value::String(s)) => serde_json::from_str::<Vec<String>>(s)
            .ok()
            .map(|v| v.iter().filter_map(|p| p.parse().ok()).collect()),
        Some(serde_json::Value::Array(arr)) => Some(
            arr.iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => s.parse().ok(),
                    serde_json::Value::Number(n) => n.as_f64(),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    };
    match parsed {
        Some(prices) => (prices.first().copied(), prices.get(1).copied()),
        None => (None, None),
    }
}

/// Parse single-degree Celsius bracket questions.
///
/// Formats:
///   "be 14°C on ..."          -> exact degree
///   "be 9°C or below on ..."  -> open-ended lower bracket
///   "be 17°C or higher on..." -> open-ended upper bracket
pub fn extract_bracket(question: &str) -> Option<Bracket> {
    let q = question.replace('\u{b0}', "");
    let below = Regex::new(r"be\s+(\d+)\s*C\s+or\s+below").ok()?;
    if let Some(caps) = below.captures(&q) {
        return Some(Bracket::at_most(caps[1].parse().ok()?));
    }
    let higher = Regex::new(r"be\s+(\d+)\s*C\s+or\s+higher").ok()?;
    if let Some(caps) = higher.captures(&q) {
        return Some(Bracket::at_least(caps[1].parse().ok()?));
    }
    let exact = Regex::new(r"be\s+(\d+)\s*C\s+on").ok()?;
    if let Some(caps) = exact.captures(&q) {
        return Some(Bracket::exact(caps[1].parse().ok()?));
    }
    None
}

/// Slug of the day's event, e.g.
/// "highest-temperature-in-paris-on-february-22-2026".
pub fn date_slug(city: &str, date: NaiveDate) -> String {
    let month = month_name(date.month());
    format!(
        "highest-temperature-in-{}-on-{}-{}-{}",
        city,
        month,
        date.day(),
        date.year()
    )
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "january",
        2 => "february",
        3 => "march",
        4 => "april",
        5 => "may",
        6 => "june",
        7 => "july",
        8 => "august",
        9 => "september",
        10 => "october",
        11 => "november",
        _ => "december",
    }
}
