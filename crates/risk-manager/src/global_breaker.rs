//! System-wide circuit breaker.
//!
//! Trips all markets at once on exchange-wide incidents: too many per-market
//! breakers open simultaneously, an API-error burst, or total tracked assets
//! falling too far from their all-time peak.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use spot_core::db::StateStore;
use spot_core::notify::{AlertKind, AlertSink, NullSink};

use crate::circuit_breaker::BreakerDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalTripReason {
    /// Too large a share of tracked markets tripped at once.
    TrippedMarketRatio,
    /// API-error burst across all markets (exchange-wide incident).
    ApiErrorBurst,
    /// Total tracked assets too far below their all-time peak.
    AssetDrawdown,
    Manual,
}

impl GlobalTripReason {
    pub fn describe(&self) -> &'static str {
        match self {
            GlobalTripReason::TrippedMarketRatio => "tripped-market ratio",
            GlobalTripReason::ApiErrorBurst => "API error burst",
            GlobalTripReason::AssetDrawdown => "asset drawdown from peak",
            GlobalTripReason::Manual => "manual trip",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalBreakerConfig {
    /// Percent of tracked markets tripped that trips the system.
    pub market_trip_ratio_pct: u32,
    /// Ratio trigger requires at least this many tracked markets.
    pub min_tracked_markets: usize,
    /// API errors inside the window that trip the system.
    pub max_api_errors: u32,
    pub api_error_window_secs: i64,
    /// Drawdown from the asset-value peak, percent.
    pub max_drawdown_pct: Decimal,
    pub cooldown_minutes: i64,
    pub enabled: bool,
}

impl Default for GlobalBreakerConfig {
    fn default() -> Self {
        Self {
            market_trip_ratio_pct: 50,
            min_tracked_markets: 2,
            max_api_errors: 10,
            api_error_window_secs: 60,
            max_drawdown_pct: Decimal::new(10, 0), // 10%
            cooldown_minutes: 1440,                // 24 hours
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalBreakerState {
    pub is_open: bool,
    pub reason: Option<GlobalTripReason>,
    pub opened_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    /// Timestamps of recent API errors (rolling window).
    pub api_errors: VecDeque<DateTime<Utc>>,
    /// All-time peak of total tracked assets.
    pub peak_asset_value: Decimal,
    pub current_asset_value: Decimal,
}

impl GlobalBreakerState {
    fn prune_api_errors(&mut self, now: DateTime<Utc>, window_secs: i64) {
        let cutoff = now - Duration::seconds(window_secs);
        while self.api_errors.front().is_some_and(|t| *t < cutoff) {
            self.api_errors.pop_front();
        }
    }

    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak_asset_value <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.peak_asset_value - self.current_asset_value) / self.peak_asset_value
            * Decimal::ONE_HUNDRED
    }
}

const STATE_KEY: &str = "breaker:global";

pub struct GlobalBreaker {
    config: GlobalBreakerConfig,
    state: RwLock<GlobalBreakerState>,
    store: Option<Arc<dyn StateStore>>,
    alerts: Arc<dyn AlertSink>,
}

impl GlobalBreaker {
    pub fn new(config: GlobalBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(GlobalBreakerState::default()),
            store: None,
            alerts: Arc::new(NullSink),
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

    /// Load persisted state on startup. Returns true when state was found.
    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(raw) = store.get(STATE_KEY).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<GlobalBreakerState>(&raw) {
            Ok(loaded) => {
                info!(is_open = loaded.is_open, "Loaded global breaker state");
                *self.state.write().await = loaded;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Corrupt global breaker state, starting fresh");
                Ok(false)
            }
        }
    }

    /// Whether any trading at all is allowed right now.
    pub async fn can_trade(&self) -> BreakerDecision {
        if !self.config.enabled {
            return BreakerDecision {
                allowed: true,
                reason: None,
            };
        }

        let now = Utc::now();
        let (decision, expired_snapshot) = {
            let mut state = self.state.write().await;
            if !state.is_open {
                (
                    BreakerDecision {
                        allowed: true,
                        reason: None,
                    },
                    None,
                )
            } else if state.resume_at.is_some_and(|t| now >= t) {
                info!("Global breaker cooldown expired, resuming");
                state.is_open = false;
                state.reason = None;
                state.opened_at = None;
                state.resume_at = None;
                (
                    BreakerDecision {
                        allowed: true,
                        reason: None,
                    },
                    Some(state.clone()),
                )
            } else {
                let reason = state
                    .reason
                    .map(|r| format!("global breaker: {}", r.describe()))
                    .unwrap_or_else(|| "global breaker open".to_string());
                (
                    BreakerDecision {
                        allowed: false,
                        reason: Some(reason),
                    },
                    None,
                )
            }
        };

        if let Some(snapshot) = expired_snapshot {
            self.persist(&snapshot).await;
        }
        decision
    }

    /// Record one API error. Trips the system on a burst inside the window.
    pub async fn record_api_error(&self, market: &str) -> Option<GlobalTripReason> {
        if !self.config.enabled {
            return None;
        }
        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut state = self.state.write().await;
            state.api_errors.push_back(now);
            state.prune_api_errors(now, self.config.api_error_window_secs);

            let tripped = if state.api_errors.len() as u32 >= self.config.max_api_errors {
                self.trip_state(&mut state, GlobalTripReason::ApiErrorBurst, now)
                    .then_some(GlobalTripReason::ApiErrorBurst)
            } else {
                None
            };
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            warn!(market = %market, "API error burst detected");
            self.announce_trip(reason, &snapshot);
        }
        self.persist(&snapshot).await;
        tripped
    }

    /// Record the current total value of tracked assets; trips on drawdown
    /// from the all-time peak.
    pub async fn record_total_asset(&self, value: Decimal) -> Option<GlobalTripReason> {
        if !self.config.enabled {
            return None;
        }
        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut state = self.state.write().await;
            state.current_asset_value = value;
            if value > state.peak_asset_value {
                state.peak_asset_value = value;
            }

            let tripped = if state.drawdown_pct() >= self.config.max_drawdown_pct {
                self.trip_state(&mut state, GlobalTripReason::AssetDrawdown, now)
                    .then_some(GlobalTripReason::AssetDrawdown)
            } else {
                None
            };
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            self.announce_trip(reason, &snapshot);
        }
        self.persist(&snapshot).await;
        tripped
    }

    /// Observe the per-market breaker book after a trip: `open` of `total`
    /// markets currently tripped.
    pub async fn observe_market_trips(&self, open: usize, total: usize) -> Option<GlobalTripReason> {
        if !self.config.enabled || total < self.config.min_tracked_markets {
            return None;
        }
        let ratio_hit = open * 100 >= total * self.config.market_trip_ratio_pct as usize;
        if !ratio_hit {
            return None;
        }

        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut state = self.state.write().await;
            let tripped = self
                .trip_state(&mut state, GlobalTripReason::TrippedMarketRatio, now)
                .then_some(GlobalTripReason::TrippedMarketRatio);
            (tripped, state.clone())
        };

        if let Some(reason) = tripped {
            warn!(open, total, "Tripped-market ratio breached");
            self.announce_trip(reason, &snapshot);
        }
        self.persist(&snapshot).await;
        tripped
    }

    /// Operator override: halt everything.
    pub async fn manual_trip(&self, note: Option<String>) {
        warn!(note = ?note, "Manual global breaker trip");
        let now = Utc::now();
        let (tripped, snapshot) = {
            let mut state = self.state.write().await;
            let tripped = self
                .trip_state(&mut state, GlobalTripReason::Manual, now)
                .then_some(GlobalTripReason::Manual);
            (tripped, state.clone())
        };
        if let Some(reason) = tripped {
            self.announce_trip(reason, &snapshot);
        }
        self.persist(&snapshot).await;
    }

    /// Operator override: clear the global halt.
    pub async fn reset(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.is_open = false;
            state.reason = None;
            state.opened_at = None;
            state.resume_at = None;
            state.clone()
        };
        self.persist(&snapshot).await;
        info!("Global breaker reset");
    }

    /// Scheduled job: drop API-error timestamps that left the window.
    /// Idempotent and safe to run beside the market loops.
    pub async fn prune_api_errors(&self) {
        let mut state = self.state.write().await;
        state.prune_api_errors(Utc::now(), self.config.api_error_window_secs);
    }

    pub async fn state(&self) -> GlobalBreakerState {
        self.state.read().await.clone()
    }

    // Private methods

    fn trip_state(
        &self,
        state: &mut GlobalBreakerState,
        reason: GlobalTripReason,
        now: DateTime<Utc>,
    ) -> bool {
        if state.is_open {
            return false;
        }
        state.is_open = true;
        state.reason = Some(reason);
        state.opened_at = Some(now);
        state.resume_at = Some(now + Duration::minutes(self.config.cooldown_minutes));
        true
    }

    fn announce_trip(&self, reason: GlobalTripReason, state: &GlobalBreakerState) {
        error!(
            reason = ?reason,
            resume_at = ?state.resume_at,
            drawdown_pct = %state.drawdown_pct(),
            "GLOBAL circuit breaker TRIPPED - all trading halted"
        );
        self.alerts.alert(
            AlertKind::GlobalBreakerTripped,
            "Global breaker tripped",
            reason.describe(),
        );
    }

    async fn persist(&self, state: &GlobalBreakerState) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = store.put(STATE_KEY, &raw).await {
                    error!(error = %e, "Failed to persist global breaker state");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize global breaker state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_core::db::MemoryStateStore;

    #[tokio::test]
    async fn test_api_error_burst_trips() {
        let breaker = GlobalBreaker::new(GlobalBreakerConfig::default());

        for _ in 0..9 {
            assert_eq!(breaker.record_api_error("KRW-BTC").await, None);
        }
        let reason = breaker.record_api_error("KRW-ETH").await;
        assert_eq!(reason, Some(GlobalTripReason::ApiErrorBurst));
        assert!(!breaker.can_trade().await.allowed);
    }

    #[tokio::test]
    async fn test_drawdown_trips_at_ten_percent() {
        let breaker = GlobalBreaker::new(GlobalBreakerConfig::default());

        breaker.record_total_asset(Decimal::new(1_000_000, 0)).await;
        // 9% down: still fine.
        assert_eq!(
            breaker.record_total_asset(Decimal::new(910_000, 0)).await,
            None
        );
        // 10% down: trip.
        assert_eq!(
            breaker.record_total_asset(Decimal::new(900_000, 0)).await,
            Some(GlobalTripReason::AssetDrawdown)
        );
    }

    #[tokio::test]
    async fn test_market_ratio_needs_minimum_tracked() {
        let breaker = GlobalBreaker::new(GlobalBreakerConfig::default());

        // One of one market tripped, but below min_tracked_markets.
        assert_eq!(breaker.observe_market_trips(1, 1).await, None);
        // Two of four: 50% ratio reached.
        assert_eq!(
            breaker.observe_market_trips(2, 4).await,
            Some(GlobalTripReason::TrippedMarketRatio)
        );
    }

    #[tokio::test]
    async fn test_trip_is_idempotent() {
        let breaker = GlobalBreaker::new(GlobalBreakerConfig::default());

        breaker.manual_trip(None).await;
        // Second trigger while open reports nothing new.
        assert_eq!(breaker.observe_market_trips(3, 4).await, None);
        assert!(!breaker.can_trade().await.allowed);

        breaker.reset().await;
        assert!(breaker.can_trade().await.allowed);
    }

    #[tokio::test]
    async fn test_state_round_trips_through_store() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let breaker =
                GlobalBreaker::new(GlobalBreakerConfig::default()).with_store(store.clone());
            breaker.manual_trip(Some("incident".to_string())).await;
        }

        let reloaded = GlobalBreaker::new(GlobalBreakerConfig::default()).with_store(store);
        assert!(reloaded.load_state().await.unwrap());
        let decision = reloaded.can_trade().await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("manual"));
    }
}
