//! Per-market circuit breakers.
//!
//! Every market accumulates its own counters (losses, execution failures,
//! slippage) in a keyed store; any trigger trips that market's breaker and
//! halts new entries there until the cooldown expires. The book is an
//! injectable component, not a process-wide singleton, so tests run against
//! isolated instances.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use spot_core::db::StateStore;
use spot_core::notify::{AlertKind, AlertSink, NullSink};

use crate::global_breaker::GlobalBreaker;

/// Reason a per-market breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketTripReason {
    /// Too many consecutive realized losses.
    ConsecutiveLosses,
    /// Cumulative same-day loss exceeded the allocated-capital limit.
    DailyLoss,
    /// Too many losing trades in the trailing 24h window.
    LossesIn24h,
    /// Consecutive order rejections/timeouts, independent of PnL.
    ExecutionFailures,
    /// Consecutive fills with slippage above the threshold.
    Slippage,
    /// Operator intervention.
    Manual,
}

impl MarketTripReason {
    /// Execution-failure trips usually indicate a transient exchange issue,
    /// so they cool down faster than loss-based trips.
    fn cooldown_minutes(&self, config: &BreakerConfig) -> i64 {
        match self {
            MarketTripReason::ExecutionFailures => config.failure_cooldown_minutes,
            _ => config.loss_cooldown_minutes,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            MarketTripReason::ConsecutiveLosses => "consecutive losses",
            MarketTripReason::DailyLoss => "daily loss limit",
            MarketTripReason::LossesIn24h => "losing trades in 24h",
            MarketTripReason::ExecutionFailures => "consecutive execution failures",
            MarketTripReason::Slippage => "consecutive high slippage",
            MarketTripReason::Manual => "manual trip",
        }
    }
}

/// Thresholds and cooldowns for per-market breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive realized losses before tripping.
    pub max_consecutive_losses: u32,
    /// Cumulative same-day loss, percent of allocated capital.
    pub max_daily_loss_pct: Decimal,
    /// Losing trades in a trailing 24h window before tripping.
    pub max_losses_24h: u32,
    /// Consecutive execution failures before tripping.
    pub max_execution_failures: u32,
    /// Consecutive high-slippage fills before tripping.
    pub max_slippage_streak: u32,
    /// Slippage above this percent counts toward the streak.
    pub slippage_threshold_pct: Decimal,
    /// Cooldown for loss/slippage/daily-loss trips (minutes).
    pub loss_cooldown_minutes: i64,
    /// Cooldown for execution-failure trips (minutes).
    pub failure_cooldown_minutes: i64,
    pub enabled: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 3,
            max_daily_loss_pct: Decimal::new(5, 0), // 5%
            max_losses_24h: 10,
            max_execution_failures: 5,
            max_slippage_streak: 3,
            slippage_threshold_pct: Decimal::new(2, 0), // 2%
            loss_cooldown_minutes: 240,                 // 4 hours
            failure_cooldown_minutes: 60,               // 1 hour
            enabled: true,
        }
    }
}

/// Accumulated state for one market's breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketBreakerState {
    pub consecutive_losses: u32,
    pub consecutive_execution_failures: u32,
    pub consecutive_high_slippage: u32,
    /// Cumulative same-day loss, percent of allocated capital (positive).
    pub daily_loss_pct: Decimal,
    pub daily_loss_count: u32,
    /// Timestamps of losses inside the trailing 24h window.
    pub loss_times_24h: VecDeque<DateTime<Utc>>,
    pub is_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    pub reason: Option<MarketTripReason>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

impl MarketBreakerState {
    fn prune_24h(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(24);
        while self.loss_times_24h.front().is_some_and(|t| *t < cutoff) {
            self.loss_times_24h.pop_front();
        }
    }

    fn clear_trip(&mut self) {
        self.is_open = false;
        self.opened_at = None;
        self.resume_at = None;
        self.reason = None;
        self.consecutive_losses = 0;
        self.consecutive_execution_failures = 0;
        self.consecutive_high_slippage = 0;
    }
}

/// Verdict returned by `can_trade`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl BreakerDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Keyed store of per-market breakers.
pub struct MarketBreakerBook {
    config: BreakerConfig,
    states: DashMap<String, MarketBreakerState>,
    store: Option<Arc<dyn StateStore>>,
    alerts: Arc<dyn AlertSink>,
    global: Option<Arc<GlobalBreaker>>,
}

impl MarketBreakerBook {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            store: None,
            alerts: Arc::new(NullSink),
            global: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Mirror market trips into the global breaker's tripped-market ratio.
    pub fn with_global(mut self, global: Arc<GlobalBreaker>) -> Self {
        self.global = Some(global);
        self
    }

    /// Record the realized outcome of a closed trade.
    ///
    /// `pnl_pct` is the trade's PnL as a percent of the capital allocated to
    /// this market; losses are negative.
    pub async fn record_trade_result(
        &self,
        market: &str,
        pnl_pct: Decimal,
    ) -> Result<Option<MarketTripReason>> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.ensure_loaded(market).await;

        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();
            state.last_trade_time = Some(now);

            if pnl_pct < Decimal::ZERO {
                state.consecutive_losses += 1;
                state.daily_loss_pct += pnl_pct.abs();
                state.daily_loss_count += 1;
                state.loss_times_24h.push_back(now);
            } else {
                state.consecutive_losses = 0;
            }
            state.prune_24h(now);

            let reason = self.check_trade_triggers(state);
            let tripped = match reason {
                Some(r) => self.trip_state(state, r, now).then_some(r),
                None => None,
            };
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            self.announce_trip(market, reason, &snapshot).await;
        }
        self.persist(market, &snapshot).await;
        Ok(tripped)
    }

    /// Record an order rejection or timeout (no PnL involved).
    pub async fn record_execution_failure(
        &self,
        market: &str,
        reason: &str,
    ) -> Result<Option<MarketTripReason>> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.ensure_loaded(market).await;

        warn!(market = %market, reason = %reason, "Execution failure recorded");
        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();
            state.consecutive_execution_failures += 1;

            let tripped = if state.consecutive_execution_failures
                >= self.config.max_execution_failures
            {
                self.trip_state(state, MarketTripReason::ExecutionFailures, now)
                    .then_some(MarketTripReason::ExecutionFailures)
            } else {
                None
            };
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            self.announce_trip(market, reason, &snapshot).await;
        }
        self.persist(market, &snapshot).await;
        Ok(tripped)
    }

    /// Record a successful execution. Resets the failure and slippage
    /// streaks; the loss streak is only reset by a winning trade.
    pub async fn record_execution_success(&self, market: &str) -> Result<()> {
        self.ensure_loaded(market).await;
        let snapshot = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();
            state.consecutive_execution_failures = 0;
            state.consecutive_high_slippage = 0;
            state.clone()
        };
        self.persist(market, &snapshot).await;
        Ok(())
    }

    /// Record observed fill slippage versus the expected price.
    pub async fn record_slippage(
        &self,
        market: &str,
        slippage_pct: Decimal,
    ) -> Result<Option<MarketTripReason>> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.ensure_loaded(market).await;

        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();

            if slippage_pct > self.config.slippage_threshold_pct {
                state.consecutive_high_slippage += 1;
                debug!(
                    market = %market,
                    slippage_pct = %slippage_pct,
                    streak = state.consecutive_high_slippage,
                    "High slippage fill"
                );
            } else {
                state.consecutive_high_slippage = 0;
            }

            let tripped = if state.consecutive_high_slippage >= self.config.max_slippage_streak {
                self.trip_state(state, MarketTripReason::Slippage, now)
                    .then_some(MarketTripReason::Slippage)
            } else {
                None
            };
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            self.announce_trip(market, reason, &snapshot).await;
        }
        self.persist(market, &snapshot).await;
        Ok(tripped)
    }

    /// Whether new entries are allowed on this market right now.
    ///
    /// Reads freshly-updated state; callers must invoke this immediately
    /// before every order submission, never cache it across ticks.
    pub async fn can_trade(&self, market: &str) -> BreakerDecision {
        if !self.config.enabled {
            return BreakerDecision::allowed();
        }
        self.ensure_loaded(market).await;

        let now = Utc::now();
        let (decision, expired_snapshot) = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();

            if !state.is_open {
                (BreakerDecision::allowed(), None)
            } else if state.resume_at.is_some_and(|t| now >= t) {
                info!(market = %market, "Breaker cooldown expired, resuming");
                state.clear_trip();
                (BreakerDecision::allowed(), Some(state.clone()))
            } else {
                let reason = state
                    .reason
                    .map(|r| r.describe().to_string())
                    .unwrap_or_else(|| "breaker open".to_string());
                let until = state
                    .resume_at
                    .map(|t| format!(" until {}", t))
                    .unwrap_or_default();
                (
                    BreakerDecision::blocked(format!("{}{}", reason, until)),
                    None,
                )
            }
        };

        if let Some(snapshot) = expired_snapshot {
            self.persist(market, &snapshot).await;
        }
        decision
    }

    /// Operator override: trip one market immediately.
    pub async fn manual_trip(&self, market: &str, note: Option<String>) {
        self.ensure_loaded(market).await;
        warn!(market = %market, note = ?note, "Manual breaker trip");

        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();
            let tripped = self
                .trip_state(state, MarketTripReason::Manual, now)
                .then_some(MarketTripReason::Manual);
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            self.announce_trip(market, reason, &snapshot).await;
        }
        self.persist(market, &snapshot).await;
    }

    /// Operator override: clear one market's breaker and counters.
    pub async fn reset_market(&self, market: &str) {
        let snapshot = {
            let mut entry = self.states.entry(market.to_string()).or_default();
            let state = entry.value_mut();
            state.clear_trip();
            state.clone()
        };
        self.persist(market, &snapshot).await;
        info!(market = %market, "Breaker manually reset");
    }

    /// Scheduled daily reset of per-day counters. Idempotent: running twice
    /// at the boundary leaves the same end state.
    pub async fn reset_daily(&self) {
        let markets: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        for market in markets {
            let snapshot = {
                let mut entry = self.states.entry(market.clone()).or_default();
                let state = entry.value_mut();
                state.daily_loss_pct = Decimal::ZERO;
                state.daily_loss_count = 0;
                state.clone()
            };
            self.persist(&market, &snapshot).await;
        }
        info!("Per-market breaker daily counters reset");
    }

    /// (open, tracked) market counts, for the global tripped-ratio trigger.
    pub fn open_counts(&self) -> (usize, usize) {
        let total = self.states.len();
        let open = self.states.iter().filter(|e| e.value().is_open).count();
        (open, total)
    }

    /// Snapshot of all per-market breaker states for the status surface.
    pub fn snapshot(&self) -> Vec<(String, MarketBreakerState)> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // Private methods

    fn check_trade_triggers(&self, state: &MarketBreakerState) -> Option<MarketTripReason> {
        if state.consecutive_losses >= self.config.max_consecutive_losses {
            return Some(MarketTripReason::ConsecutiveLosses);
        }
        if state.daily_loss_pct >= self.config.max_daily_loss_pct {
            return Some(MarketTripReason::DailyLoss);
        }
        if state.loss_times_24h.len() as u32 >= self.config.max_losses_24h {
            return Some(MarketTripReason::LossesIn24h);
        }
        None
    }

    /// Trip the breaker. Returns true only for a fresh trip. Idempotent: an
    /// already-open breaker only has its resume time pushed out (never
    /// pulled in) when a trigger with a longer cooldown fires, and no second
    /// notification is emitted.
    fn trip_state(
        &self,
        state: &mut MarketBreakerState,
        reason: MarketTripReason,
        now: DateTime<Utc>,
    ) -> bool {
        let resume_at = now + Duration::minutes(reason.cooldown_minutes(&self.config));

        if state.is_open {
            if state.resume_at.map_or(true, |t| resume_at > t) {
                debug!(reason = ?reason, resume_at = %resume_at, "Extending open breaker cooldown");
                state.resume_at = Some(resume_at);
            }
            return false;
        }

        state.is_open = true;
        state.reason = Some(reason);
        state.opened_at = Some(now);
        state.resume_at = Some(resume_at);
        true
    }

    async fn announce_trip(
        &self,
        market: &str,
        reason: MarketTripReason,
        state: &MarketBreakerState,
    ) {
        error!(
            market = %market,
            reason = ?reason,
            resume_at = ?state.resume_at,
            consecutive_losses = state.consecutive_losses,
            daily_loss_pct = %state.daily_loss_pct,
            "Circuit breaker TRIPPED - new entries halted"
        );
        self.alerts.alert(
            AlertKind::BreakerTripped,
            &format!("Breaker tripped: {}", market),
            &format!(
                "{} (resumes {})",
                reason.describe(),
                state
                    .resume_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        );

        if let Some(global) = &self.global {
            let (open, total) = self.open_counts();
            global.observe_market_trips(open, total).await;
        }
    }

    /// Hydrate a market's state from the durable store on first touch.
    async fn ensure_loaded(&self, market: &str) {
        if self.states.contains_key(market) {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        match store.get(&Self::state_key(market)).await {
            Ok(Some(raw)) => match serde_json::from_str::<MarketBreakerState>(&raw) {
                Ok(state) => {
                    info!(market = %market, is_open = state.is_open, "Loaded breaker state");
                    self.states.entry(market.to_string()).or_insert(state);
                }
                Err(e) => warn!(market = %market, error = %e, "Corrupt breaker state, starting fresh"),
            },
            Ok(None) => {}
            Err(e) => warn!(market = %market, error = %e, "Failed to load breaker state"),
        }
    }

    async fn persist(&self, market: &str, state: &MarketBreakerState) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = store.put(&Self::state_key(market), &raw).await {
                    error!(market = %market, error = %e, "Failed to persist breaker state");
                }
            }
            Err(e) => error!(market = %market, error = %e, "Failed to serialize breaker state"),
        }
    }

    fn state_key(market: &str) -> String {
        format!("breaker:{}", market)
    }
}
