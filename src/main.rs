mod config;
mod data;
mod execution;
mod monitoring;
mod strategies;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use config::{Config, EnvConfig};
use data::cache::SnapshotCache;
use data::gamma_api::{date_slug, GammaApiClient};
use data::observations::Aggregator;
use data::sources::WeatherSources;
use data::types::{BracketQuote, SourceId};
use execution::ledger::PaperLedger;
use execution::persistence::PositionStore;
use monitoring::event_log::EventLog;
use strategies::bias::BiasEstimator;
use strategies::detector::{Candidate, Detection, DetectionEngine, EvalContext};
use strategies::guard::{Guard, GuardContext};

/// How many times a ledger write is attempted before the signal is left
/// uncommitted for the next cycle to retry.
const LEDGER_OPEN_ATTEMPTS: u32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Temperature market monitor starting...");

    let env = EnvConfig::load();
    let mut config = Config::load(&env.config_path)?;
    if let Some(city) = env.city_override {
        info!("City override from environment: {}", city);
        config.market.city = city;
    }
    info!(
        "Monitoring {} via station {} (SYNOP {})",
        config.market.city, config.station.metar_station, config.station.synop_block
    );
    if config.strategy.predictive_enabled {
        warn!("Predictive tier is ACTIVE: late-day ceiling signals will trade");
    }

    let store = PositionStore::open(&config.system.database_path)?;
    let ledger = PaperLedger::new(
        store,
        config.trading.starting_balance,
        config.trading.trade_size,
    )?;
    info!("Ledger balance: ${:.2}", ledger.balance());

    let mut monitor = Monitor::new(config, ledger);

    loop {
        let sleep = monitor.poll_interval();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down.");
                break;
            }
            _ = tokio::time::sleep(sleep) => {
                if let Err(e) = monitor.run_cycle().await {
                    error!("Cycle failed: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

struct Monitor {
    config: Config,
    sources: WeatherSources,
    gamma: GammaApiClient,
    cache: SnapshotCache,
    aggregator: Aggregator,
    bias: BiasEstimator,
    engine: DetectionEngine,
    guard: Guard,
    ledger: PaperLedger,
    event_log: EventLog,
}

impl Monitor {
    fn new(config: Config, ledger: PaperLedger) -> Self {
        let local_date = local_now(config.station.utc_offset_hours).date_naive();
        // One poll interval of tolerance before a board snapshot is dropped
        let board_ttl = Duration::from_secs(config.monitor.poll_minutes_day * 60);
        Self {
            sources: WeatherSources::new(config.station.clone()),
            gamma: GammaApiClient::new(config.market.gamma_base_url.clone()),
            cache: SnapshotCache::new(board_ttl),
            aggregator: Aggregator::new(local_date, config.monitor.staleness_bound_minutes),
            bias: BiasEstimator::new(
                config.strategy.static_bias,
                config.strategy.dynamic_bias_danger_ceiling,
            ),
            engine: DetectionEngine::new(config.strategy.clone()),
            guard: Guard::new(config.guard.clone()),
            event_log: EventLog::new(config.system.event_log_path.clone()),
            ledger,
            config,
        }
    }

    fn local_now(&self) -> DateTime<Utc> {
        local_now(self.config.station.utc_offset_hours)
    }

    fn poll_interval(&self) -> Duration {
        let hour = self.local_now().hour();
        let minutes = if (self.config.monitor.day_start_hour..self.config.monitor.day_end_hour)
            .contains(&hour)
        {
            self.config.monitor.poll_minutes_day
        } else {
            self.config.monitor.poll_minutes_night
        };
        Duration::from_secs(minutes * 60)
    }

    async fn run_cycle(&mut self) -> Result<()> {
        let now_local = self.local_now();
        let today = now_local.date_naive();
        let hour = fractional_hour(&now_local);

        if today != self.aggregator.state.date {
            self.finish_day(today)?;
        }

        // Fetch everything for the cycle before touching any state, so a
        // slow or failed feed cannot leave the cycle half-applied.
        let (metar, synop, openmeteo) = tokio::join!(
            self.sources.fetch_metar(),
            self.sources.fetch_synop(),
            self.sources.fetch_openmeteo_current()
        );
        if self.aggregator.state.forecast_high_raw.is_none() {
            self.aggregator.state.forecast_high_raw = self.sources.fetch_forecast_high().await;
            if let Some(raw) = self.aggregator.state.forecast_high_raw {
                info!(
                    "Forecast high today: {:.1}°C raw, {:.1}°C corrected",
                    raw,
                    self.bias.corrected_forecast(raw)
                );
            }
        }
        if self.aggregator.state.hourly_forecast.is_empty() {
            self.aggregator.state.hourly_forecast = self.sources.fetch_hourly_profile().await;
        }
        let board = self.fetch_board(today).await;

        let metar_fresh = self.record_readings(hour, metar, synop, openmeteo);

        let board = match board {
            Some(b) if !b.is_empty() => b,
            _ => {
                warn!("No market board this cycle, nothing to evaluate");
                return Ok(());
            }
        };
        self.event_log.log_snapshot(
            &board
                .iter()
                .map(|q| (q.bracket.label(), q.yes_price))
                .collect::<Vec<_>>(),
        )?;

        self.evaluate(&board, today, hour, metar_fresh)?;
        Ok(())
    }

    /// Returns whether a fresh ground-truth reading landed this cycle.
    fn record_readings(
        &mut self,
        hour: f64,
        metar: Option<f64>,
        synop: Option<(f64, u32)>,
        openmeteo: Option<f64>,
    ) -> bool {
        let now = Utc::now();
        let offset = self.config.station.utc_offset_hours;
        let mut batch = Vec::new();
        if let Some(t) = metar {
            batch.push((SourceId::Metar, t, hour));
        }
        if let Some((t, hour_utc)) = synop {
            batch.push((SourceId::Synop, t, synop_local_hour(hour_utc, offset)));
        }
        if let Some(t) = openmeteo {
            batch.push((SourceId::OpenMeteo, t, hour));
        }
        let mut metar_fresh = false;
        for (source, temp, at_hour) in batch {
            match self.aggregator.ingest(source, temp, now, at_hour) {
                Ok(obs) => {
                    self.aggregator.record(&obs);
                    if source == SourceId::Metar {
                        metar_fresh = true;
                    }
                    if let Err(e) = self.event_log.log_observation(
                        source.label(),
                        obs.local_hour,
                        obs.temp_c,
                        self.aggregator.state.running_max,
                    ) {
                        warn!("Event log write failed: {}", e);
                    }
                }
                Err(e) => warn!("Rejected reading: {}", e),
            }
        }
        metar_fresh
    }

    async fn fetch_board(&self, date: NaiveDate) -> Option<Vec<BracketQuote>> {
        let slug = date_slug(&self.config.market.city, date);
        match self.gamma.fetch_bracket_board(&slug).await {
            Ok(board) => {
                self.cache.insert(&slug, board.clone());
                Some(board)
            }
            Err(e) => {
                warn!("Market fetch failed ({}), trying cached board", e);
                self.cache.get(&slug)
            }
        }
    }

    fn evaluate(
        &mut self,
        board: &[BracketQuote],
        today: NaiveDate,
        hour: f64,
        metar_fresh: bool,
    ) -> Result<()> {
        let morning = hour >= self.config.monitor.morning_trigger_hour as f64
            && !self.aggregator.state.morning_done;
        let midday = hour >= self.config.monitor.midday_trigger_hour as f64
            && !self.aggregator.state.midday_done;
        // The bias is pinned to the morning observation window; midday only
        // computes it if the morning trigger never managed to.
        if morning || (midday && self.aggregator.state.dynamic_bias.is_none()) {
            self.refresh_dynamic_bias();
        }

        let state = &self.aggregator.state;
        let corrected = state.forecast_high_raw.map(|r| self.bias.corrected_forecast(r));
        let dynamic = state
            .forecast_high_raw
            .map(|r| self.bias.dynamic_forecast(r, state.dynamic_bias));
        let hourly = state.hourly_forecast.clone();
        let ctx = EvalContext {
            date: today,
            now: Utc::now(),
            local_hour: hour,
            running_max: state.running_max,
            corrected_forecast: corrected,
            dynamic_forecast: dynamic,
            dynamic_bias: state.dynamic_bias,
            dynamic_bias_dangerous: self.bias.dynamic_bias_dangerous(state.dynamic_bias),
            hourly_forecast: &hourly,
            forecast_trend: self.aggregator.trend(SourceId::OpenMeteo, hour),
        };

        // The continuous trigger fires only on a fresh ground-truth reading;
        // a stale cycle must never kill a bracket off old data.
        let mut detections = if metar_fresh {
            self.engine.evaluate_certainty(board, &ctx)
        } else {
            Vec::new()
        };
        if morning {
            detections.extend(self.engine.evaluate_forecast(board, &ctx));
            detections.extend(self.engine.evaluate_upper(board, &ctx));
        }
        if midday {
            detections.extend(self.engine.evaluate_midday(board, &ctx));
        }
        // Degraded data suppresses only the speculative late-day tier; the
        // certainty path above already demands a fresh reading.
        if self.aggregator.degraded(Utc::now()) {
            warn!("All observation feeds stale, predictive tier suppressed");
        } else {
            detections.extend(self.engine.evaluate_predictive(
                board,
                &ctx,
                self.config.monitor.late_day_hour,
            ));
        }

        let mut all_opened = true;
        for detection in detections {
            match detection {
                Detection::Blocked { id, reasons } => {
                    warn!("{} blocked: {}", id.key(), reasons.join("; "));
                    self.event_log.log_blocked(&id.key(), &reasons)?;
                    self.aggregator.state.signals_blocked += 1;
                    self.engine.commit(&id);
                }
                Detection::Candidate(candidate) => {
                    if !self.process_candidate(candidate, board, hour)? {
                        all_opened = false;
                    }
                }
            }
        }

        // Keep retrying the trigger until every candidate reached the book;
        // committed keys make the retry a no-op for the ones that did.
        if morning && all_opened {
            self.aggregator.state.morning_done = true;
            self.morning_report(board, hour)?;
        }
        if midday && all_opened {
            self.aggregator.state.midday_done = true;
        }
        Ok(())
    }

    /// Mean (METAR - model) over the readings up to the morning trigger hour.
    /// The window is fixed so a later recomputation cannot dilute the early-day
    /// error with afternoon readings.
    fn refresh_dynamic_bias(&mut self) {
        let up_to_hour = self.config.monitor.morning_trigger_hour as f64;
        let state = &mut self.aggregator.state;
        if state.hourly_forecast.is_empty() {
            return;
        }
        let ground_truth = state.readings(SourceId::Metar).to_vec();
        match self
            .bias
            .dynamic_bias(&ground_truth, &state.hourly_forecast, up_to_hour)
        {
            Some(b) => {
                info!("Dynamic forecast bias: {:+.2}°C", b);
                state.dynamic_bias = Some(b);
            }
            None => info!("No observation/forecast pairs yet, dynamic bias unavailable"),
        }
    }

    /// Returns false when the ledger refused the trade and the signal was
    /// left uncommitted for a later retry.
    fn process_candidate(
        &mut self,
        candidate: Candidate,
        board: &[BracketQuote],
        hour: f64,
    ) -> Result<bool> {
        let signal = candidate.signal;

        let quote = board
            .iter()
            .find(|q| q.bracket.label() == signal.id.bracket);
        let guard_result = {
            let state = &self.aggregator.state;
            let ctx = GuardContext {
                local_hour: hour,
                running_max: state.running_max,
                bracket_floor: quote.and_then(|q| q.bracket.floor),
                forecast_high: state
                    .forecast_high_raw
                    .map(|r| self.bias.dynamic_forecast(r, state.dynamic_bias)),
                hourly_forecast: &state.hourly_forecast,
                hourly_correction: self.config.strategy.static_bias
                    + state.dynamic_bias.unwrap_or(0.0).max(0.0),
                velocity: self.aggregator.velocity(hour).map(|(_, v)| v),
                trends: self.aggregator.source_trends(hour),
                dynamic_bias_dangerous: self.bias.dynamic_bias_dangerous(state.dynamic_bias),
            };
            self.guard.evaluate(signal.id.tier, &ctx)
        };

        if guard_result.is_blocked() {
            warn!(
                "SIGNAL {} blocked by guard: {}",
                signal.id.key(),
                guard_result.reasons.join("; ")
            );
            self.event_log
                .log_signal(&signal, false, Some(&guard_result))?;
            self.aggregator.state.signals_fired += 1;
            self.aggregator.state.signals_blocked += 1;
            self.engine.commit(&signal.id);
            return Ok(true);
        }

        if !candidate.tradeable {
            info!(
                "SIGNAL {} (dormant tier, logged only): {}",
                signal.id.key(),
                signal.note
            );
            self.event_log
                .log_signal(&signal, false, Some(&guard_result))?;
            self.aggregator.state.signals_fired += 1;
            self.engine.commit(&signal.id);
            return Ok(true);
        }

        let (bracket, question) = match quote {
            Some(q) => (q.bracket.clone(), q.question.clone()),
            None => {
                warn!("Quote for {} vanished mid-cycle, retrying later", signal.id.key());
                return Ok(false);
            }
        };

        info!("SIGNAL {}: {}", signal.id.key(), signal.note);
        self.event_log.log_signal(&signal, true, Some(&guard_result))?;

        for attempt in 1..=LEDGER_OPEN_ATTEMPTS {
            match self.ledger.open(&signal, &bracket, &question) {
                Ok(position) => {
                    self.event_log.log_position(&position)?;
                    // Counted here rather than at emission, so a signal the
                    // ledger refused and a later cycle re-fired stays one.
                    self.aggregator.state.signals_fired += 1;
                    self.aggregator.state.trades_opened += 1;
                    self.engine.commit(&signal.id);
                    return Ok(true);
                }
                Err(e) if attempt < LEDGER_OPEN_ATTEMPTS => {
                    warn!("Ledger open failed (attempt {}): {:#}", attempt, e);
                }
                Err(e) => {
                    error!("Ledger open failed, will retry next cycle: {:#}", e);
                }
            }
        }
        Ok(false)
    }

    /// Day rollover: resolve yesterday's book against the final running max,
    /// emit the daily summary, and reset all per-day state.
    fn finish_day(&mut self, new_date: NaiveDate) -> Result<()> {
        let finished = self.aggregator.rollover(new_date);
        self.engine.reset_for_day();

        match finished.running_max {
            Some(high) => {
                let rounded = high.round();
                let closed = self.ledger.resolve_day(finished.date, rounded)?;
                for position in &closed {
                    self.event_log.log_position(position)?;
                }
                let day_pnl: f64 = closed.iter().filter_map(|p| p.pnl).sum();
                // How far the corrected model missed the actual high; feeds
                // recalibration of the static bias.
                let forecast_error = finished
                    .forecast_high_raw
                    .map(|raw| high - self.bias.corrected_forecast(raw));
                let wins = closed
                    .iter()
                    .filter(|p| p.pnl.map(|v| v > 0.0).unwrap_or(false))
                    .count();
                info!(
                    "Day {} resolved at {:.0}°C: {} positions closed ({} wins), pnl {:+.2}, balance ${:.2}",
                    finished.date,
                    rounded,
                    closed.len(),
                    wins,
                    day_pnl,
                    self.ledger.balance()
                );
                self.event_log.log_summary(json!({
                    "date": finished.date.to_string(),
                    "final_high": high,
                    "rounded_high": rounded,
                    "forecast_high_raw": finished.forecast_high_raw,
                    "forecast_error": forecast_error,
                    "dynamic_bias": finished.dynamic_bias,
                    "positions_closed": closed.len(),
                    "wins": wins,
                    "day_pnl": day_pnl,
                    "balance": self.ledger.balance(),
                    "signals_fired": finished.signals_fired,
                    "signals_blocked": finished.signals_blocked,
                    "trades_opened": finished.trades_opened,
                }))?;
            }
            None => {
                // Without a ground-truth high the day cannot be resolved;
                // positions stay open until an operator settles them.
                let open = self.ledger.open_positions_for_date(finished.date)?;
                if !open.is_empty() {
                    warn!(
                        "Day {} ended with no ground-truth high, {} positions left open",
                        finished.date,
                        open.len()
                    );
                }
            }
        }
        Ok(())
    }

    fn morning_report(&self, board: &[BracketQuote], hour: f64) -> Result<()> {
        let state = &self.aggregator.state;
        let corrected = state
            .forecast_high_raw
            .map(|r| self.bias.corrected_forecast(r));
        let (trend_source, trend) = self.aggregator.trend_with_fallback(SourceId::Metar, hour);
        let dead = self.engine.dead_brackets();
        let alive: Vec<String> = board
            .iter()
            .filter(|q| !q.closed && !self.engine.is_dead(&q.bracket.label()))
            .map(|q| q.bracket.label())
            .collect();
        info!(
            "Morning report: running_max={:?}, forecast={:?}, bias={:?}, trend={:?} ({}), {} dead / {} alive",
            state.running_max,
            corrected,
            state.dynamic_bias,
            trend,
            trend_source.label(),
            dead.len(),
            alive.len()
        );
        self.event_log.log_summary(json!({
            "report": "morning",
            "date": state.date.to_string(),
            "running_max": state.running_max,
            "forecast_high_raw": state.forecast_high_raw,
            "forecast_high_corrected": corrected,
            "dynamic_bias": state.dynamic_bias,
            "trend": trend,
            "trend_source": trend_source.label(),
            "dead": dead
                .iter()
                .map(|(bracket, tier)| json!({ "bracket": bracket, "tier": tier.label() }))
                .collect::<Vec<_>>(),
            "alive": alive,
            "balance": self.ledger.balance(),
        }))
    }
}

fn local_now(utc_offset_hours: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::hours(utc_offset_hours)
}

fn fractional_hour(dt: &DateTime<Utc>) -> f64 {
    dt.hour() as f64 + dt.minute() as f64 / 60.0
}

/// SYNOP reports carry their hour in UTC; shifting by the station offset can
/// step over midnight in either direction.
fn synop_local_hour(hour_utc: u32, utc_offset_hours: i64) -> f64 {
    (hour_utc as f64 + utc_offset_hours as f64).rem_euclid(24.0)
}
