//! Regime-aware strategy selector with anti-whipsaw hysteresis.
//!
//! A regime change only takes effect after N consecutive identical samples
//! AND a minimum dwell time since the last activation. Until both hold, the
//! previously activated strategy keeps running. Low classifier confidence
//! bypasses regime logic entirely and falls back to the defensive strategy.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use spot_core::db::StateStore;
use spot_core::types::{MarketRegime, RegimeSample};

use crate::strategy::{DcaStrategy, Strategy};

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Consecutive identical regime samples required to confirm a change.
    pub confirmations: u32,
    /// Minimum time between strategy activations for one market.
    pub min_dwell_minutes: i64,
    /// Regime confidence below this falls back to the defensive strategy.
    pub confidence_floor: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            confirmations: 3,
            min_dwell_minutes: 60,
            confidence_floor: 0.4,
        }
    }
}

/// The strategy currently activated for a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSelection {
    pub strategy: String,
    pub activated_at: DateTime<Utc>,
    pub regime: MarketRegime,
}

#[derive(Debug, Clone, Default)]
struct SelectorState {
    active: Option<ActiveSelection>,
    /// Regime currently accumulating confirmations.
    candidate: Option<MarketRegime>,
    streak: u32,
    loaded: bool,
}

pub struct StrategySelector {
    config: SelectorConfig,
    strategies: Vec<Arc<dyn Strategy>>,
    fallback: Arc<dyn Strategy>,
    states: DashMap<String, SelectorState>,
    store: Option<Arc<dyn StateStore>>,
}

impl StrategySelector {
    pub fn new(config: SelectorConfig, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self {
            config,
            strategies,
            fallback: Arc::new(DcaStrategy::default()),
            states: DashMap::new(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The strategy to run for this market right now.
    ///
    /// Returns the activated strategy; activation only changes once the
    /// regime is confirmed and the dwell time has elapsed.
    pub async fn select(&self, market: &str, sample: &RegimeSample) -> Arc<dyn Strategy> {
        self.ensure_loaded(market).await;

        if sample.confidence < self.config.confidence_floor {
            debug!(
                market = %market,
                confidence = sample.confidence,
                "Regime confidence below floor, using defensive strategy"
            );
            // Transient fallback: the active selection and any accumulating
            // confirmation streak are left untouched.
            return Arc::clone(&self.fallback);
        }

        let desired = self.strategy_for_regime(sample.regime);

        let (activated, current) = {
            let mut state = self.states.entry(market.to_string()).or_default();

            let already_active = state
                .active
                .as_ref()
                .map(|a| a.strategy == desired.name())
                .unwrap_or(false);
            if already_active {
                state.candidate = None;
                state.streak = 0;
                (None, Arc::clone(&desired))
            } else {
                if state.candidate == Some(sample.regime) {
                    state.streak += 1;
                } else {
                    state.candidate = Some(sample.regime);
                    state.streak = 1;
                }

                let confirmed = state.streak >= self.config.confirmations;
                let dwell_elapsed = state.active.as_ref().map_or(true, |a| {
                    Utc::now() - a.activated_at
                        >= Duration::minutes(self.config.min_dwell_minutes)
                });

                if confirmed && dwell_elapsed {
                    let selection = ActiveSelection {
                        strategy: desired.name().to_string(),
                        activated_at: Utc::now(),
                        regime: sample.regime,
                    };
                    state.active = Some(selection.clone());
                    state.candidate = None;
                    state.streak = 0;
                    (Some(selection), Arc::clone(&desired))
                } else {
                    if confirmed {
                        debug!(
                            market = %market,
                            regime = %sample.regime,
                            "Regime confirmed, waiting out dwell time"
                        );
                    }
                    // Hysteresis holds: keep running whatever was active.
                    let current = state
                        .active
                        .as_ref()
                        .and_then(|a| self.strategy_by_name(&a.strategy))
                        .unwrap_or_else(|| Arc::clone(&self.fallback));
                    (None, current)
                }
            }
        };

        if let Some(selection) = activated {
            info!(
                market = %market,
                strategy = %selection.strategy,
                regime = %selection.regime,
                "Activated strategy"
            );
            self.persist(market, &selection).await;
        }
        current
    }

    /// Current activation for a market, if any.
    pub async fn active(&self, market: &str) -> Option<ActiveSelection> {
        self.ensure_loaded(market).await;
        self.states.get(market).and_then(|s| s.active.clone())
    }

    // Private methods

    /// Most specific suitable strategy for a regime; the defensive fallback
    /// suits everything.
    fn strategy_for_regime(&self, regime: MarketRegime) -> Arc<dyn Strategy> {
        self.strategies
            .iter()
            .find(|s| s.is_suitable_for(regime))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    fn strategy_by_name(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        if self.fallback.name() == name {
            return Some(Arc::clone(&self.fallback));
        }
        self.strategies.iter().find(|s| s.name() == name).cloned()
    }

    async fn ensure_loaded(&self, market: &str) {
        if self.states.get(market).map(|s| s.loaded).unwrap_or(false) {
            return;
        }
        let loaded = match &self.store {
            Some(store) => match store.get(&selection_key(market)).await {
                Ok(Some(raw)) => match serde_json::from_str::<ActiveSelection>(&raw) {
                    Ok(selection) => {
                        info!(
                            market = %market,
                            strategy = %selection.strategy,
                            "Restored active strategy selection"
                        );
                        Some(selection)
                    }
                    Err(e) => {
                        warn!(market = %market, error = %e, "Corrupt selection state, ignoring");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(market = %market, error = %e, "Failed to load selection state");
                    None
                }
            },
            None => None,
        };

        let mut state = self.states.entry(market.to_string()).or_default();
        if !state.loaded {
            state.active = loaded;
            state.loaded = true;
        }
    }

    async fn persist(&self, market: &str, selection: &ActiveSelection) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(selection) {
            Ok(raw) => {
                if let Err(e) = store.put(&selection_key(market), &raw).await {
                    error!(market = %market, error = %e, "Failed to persist selection");
                }
            }
            Err(e) => error!(market = %market, error = %e, "Failed to serialize selection"),
        }
    }
}

fn selection_key(market: &str) -> String {
    format!("selector:{market}")
}
