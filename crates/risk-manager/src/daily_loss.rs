//! Daily realized-loss tracking, equity drawdown, and strategy correlation.
//!
//! The trading day rolls at a configurable local midnight (KST by default),
//! not UTC midnight. Once realized losses cross the daily limit, new entries
//! halt until the next local day.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use spot_core::db::StateStore;
use spot_core::notify::{AlertKind, AlertSink, NullSink};

#[derive(Debug, Clone)]
pub struct DailyLossConfig {
    /// Capital base the loss percentage is measured against.
    pub capital: Decimal,
    /// Realized daily loss, percent of capital, that halts new entries.
    pub max_daily_loss_pct: Decimal,
    /// Local-day boundary offset from UTC, hours. 9 = KST.
    pub utc_offset_hours: i32,
    /// Per-strategy return samples kept for correlation.
    pub correlation_window: usize,
    /// Pearson correlation above this emits a warning.
    pub correlation_threshold: f64,
}

impl Default for DailyLossConfig {
    fn default() -> Self {
        Self {
            capital: Decimal::new(1_000_000, 0),
            max_daily_loss_pct: Decimal::new(5, 0),
            utc_offset_hours: 9,
            correlation_window: 20,
            correlation_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLossState {
    /// Local trading date this state belongs to.
    pub date: NaiveDate,
    /// Net realized PnL for the day (losses negative).
    pub realized_pnl: Decimal,
    /// Realized loss as a percent of capital (0 when the day is net positive).
    pub loss_pct: Decimal,
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
}

impl DailyLossState {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            realized_pnl: Decimal::ZERO,
            loss_pct: Decimal::ZERO,
            trading_halted: false,
            halt_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrawdownState {
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown_pct: Decimal,
    pub max_drawdown_pct: Decimal,
}

/// Two strategies whose recent returns move together.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationWarning {
    pub strategy_a: String,
    pub strategy_b: String,
    pub correlation: f64,
}

const DAILY_KEY: &str = "daily_loss";
const DRAWDOWN_KEY: &str = "drawdown";

pub struct DailyLossTracker {
    config: DailyLossConfig,
    daily: RwLock<DailyLossState>,
    drawdown: RwLock<DrawdownState>,
    /// Per-strategy recent trade returns (pct), oldest first.
    strategy_returns: DashMap<String, VecDeque<f64>>,
    store: Option<Arc<dyn StateStore>>,
    alerts: Arc<dyn AlertSink>,
}

impl DailyLossTracker {
    pub fn new(config: DailyLossConfig) -> Self {
        let today = Self::local_date_for(config.utc_offset_hours);
        Self {
            config,
            daily: RwLock::new(DailyLossState::fresh(today)),
            drawdown: RwLock::new(DrawdownState::default()),
            strategy_returns: DashMap::new(),
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

    fn local_date_for(offset_hours: i32) -> NaiveDate {
        (Utc::now() + Duration::hours(offset_hours as i64)).date_naive()
    }

    fn local_date(&self) -> NaiveDate {
        Self::local_date_for(self.config.utc_offset_hours)
    }

    /// Load persisted state on startup. A persisted day that already ended
    /// is discarded.
    pub async fn load_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if let Some(raw) = store.get(DAILY_KEY).await? {
            match serde_json::from_str::<DailyLossState>(&raw) {
                Ok(loaded) if loaded.date == self.local_date() => {
                    info!(
                        realized_pnl = %loaded.realized_pnl,
                        halted = loaded.trading_halted,
                        "Loaded daily loss state"
                    );
                    *self.daily.write().await = loaded;
                }
                Ok(_) => info!("Persisted daily loss state is stale, starting a new day"),
                Err(e) => warn!(error = %e, "Corrupt daily loss state, starting fresh"),
            }
        }

        if let Some(raw) = store.get(DRAWDOWN_KEY).await? {
            match serde_json::from_str::<DrawdownState>(&raw) {
                Ok(loaded) => *self.drawdown.write().await = loaded,
                Err(e) => warn!(error = %e, "Corrupt drawdown state, starting fresh"),
            }
        }
        Ok(())
    }

    /// Record realized PnL from a closed trade. Returns true when this
    /// closing pushed the day over the loss limit.
    pub async fn record_realized_pnl(&self, strategy: &str, pnl: Decimal) -> bool {
        let today = self.local_date();
        let (newly_halted, snapshot) = {
            let mut daily = self.daily.write().await;
            if daily.date != today {
                *daily = DailyLossState::fresh(today);
            }
            daily.realized_pnl += pnl;

            daily.loss_pct = if daily.realized_pnl < Decimal::ZERO && self.config.capital > Decimal::ZERO
            {
                -daily.realized_pnl / self.config.capital * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };

            let newly_halted = if !daily.trading_halted
                && daily.loss_pct >= self.config.max_daily_loss_pct
            {
                daily.trading_halted = true;
                daily.halt_reason = Some(format!(
                    "daily loss {:.2}% reached limit {}%",
                    daily.loss_pct, self.config.max_daily_loss_pct
                ));
                true
            } else {
                false
            };
            (newly_halted, daily.clone())
        };

        // Keep per-strategy return samples for the correlation check.
        if self.config.capital > Decimal::ZERO {
            let ret = (pnl / self.config.capital * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            let mut samples = self.strategy_returns.entry(strategy.to_string()).or_default();
            samples.push_back(ret);
            while samples.len() > self.config.correlation_window {
                samples.pop_front();
            }
        }

        if newly_halted {
            error!(
                loss_pct = %snapshot.loss_pct,
                "Daily loss limit reached - halting new entries until next local day"
            );
            self.alerts.alert(
                AlertKind::DailyLossHalt,
                "Daily loss limit reached",
                snapshot.halt_reason.as_deref().unwrap_or("limit reached"),
            );
        }
        self.persist_daily(&snapshot).await;
        newly_halted
    }

    /// Whether new entries are allowed today.
    pub async fn is_trading_allowed(&self) -> bool {
        let today = self.local_date();
        let (allowed, rolled) = {
            let mut daily = self.daily.write().await;
            if daily.date != today {
                info!(date = %today, "New local trading day, daily loss counters reset");
                *daily = DailyLossState::fresh(today);
                (true, Some(daily.clone()))
            } else {
                (!daily.trading_halted, None)
            }
        };
        if let Some(snapshot) = rolled {
            self.persist_daily(&snapshot).await;
        }
        allowed
    }

    /// Pre-trade check: would realizing `potential_loss` (a positive amount)
    /// push the day over the limit?
    pub async fn check_before_trade(&self, potential_loss: Decimal) -> bool {
        if self.config.capital <= Decimal::ZERO {
            return false;
        }
        let daily = self.daily.read().await;
        let realized_loss = if daily.realized_pnl < Decimal::ZERO {
            -daily.realized_pnl
        } else {
            Decimal::ZERO
        };
        let projected_pct =
            (realized_loss + potential_loss) / self.config.capital * Decimal::ONE_HUNDRED;
        projected_pct < self.config.max_daily_loss_pct
    }

    /// Update the equity curve and drawdown-from-peak statistics.
    pub async fn update_equity(&self, equity: Decimal) {
        let snapshot = {
            let mut dd = self.drawdown.write().await;
            dd.current_equity = equity;
            if equity > dd.peak_equity {
                dd.peak_equity = equity;
            }
            dd.current_drawdown_pct = if dd.peak_equity > Decimal::ZERO {
                (dd.peak_equity - equity) / dd.peak_equity * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };
            if dd.current_drawdown_pct > dd.max_drawdown_pct {
                dd.max_drawdown_pct = dd.current_drawdown_pct;
            }
            dd.clone()
        };
        self.persist_drawdown(&snapshot).await;
    }

    /// Strategy pairs whose recent returns correlate above the threshold.
    /// Advisory only, never blocks trades.
    pub fn correlation_warnings(&self) -> Vec<CorrelationWarning> {
        let series: Vec<(String, Vec<f64>)> = self
            .strategy_returns
            .iter()
            .filter(|e| e.value().len() >= self.config.correlation_window / 2)
            .map(|e| (e.key().clone(), e.value().iter().copied().collect()))
            .collect();

        let mut warnings = Vec::new();
        for i in 0..series.len() {
            for j in (i + 1)..series.len() {
                let n = series[i].1.len().min(series[j].1.len());
                let a = &series[i].1[series[i].1.len() - n..];
                let b = &series[j].1[series[j].1.len() - n..];
                let corr = pearson(a, b);
                if corr >= self.config.correlation_threshold {
                    warn!(
                        a = %series[i].0,
                        b = %series[j].0,
                        correlation = corr,
                        "Strategies are highly correlated"
                    );
                    warnings.push(CorrelationWarning {
                        strategy_a: series[i].0.clone(),
                        strategy_b: series[j].0.clone(),
                        correlation: corr,
                    });
                }
            }
        }
        warnings
    }

    pub async fn daily_state(&self) -> DailyLossState {
        self.daily.read().await.clone()
    }

    pub async fn drawdown_state(&self) -> DrawdownState {
        self.drawdown.read().await.clone()
    }

    /// Scheduled job: roll the day if the boundary passed. Idempotent.
    pub async fn roll_day_if_needed(&self) {
        self.is_trading_allowed().await;
    }

    // Private methods

    async fn persist_daily(&self, state: &DailyLossState) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = store.put(DAILY_KEY, &raw).await {
                    error!(error = %e, "Failed to persist daily loss state");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize daily loss state"),
        }
    }

    async fn persist_drawdown(&self, state: &DrawdownState) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(state) {
            Ok(raw) => {
                if let Err(e) = store.put(DRAWDOWN_KEY, &raw).await {
                    error!(error = %e, "Failed to persist drawdown state");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize drawdown state"),
        }
    }
}

/// Pearson correlation of two equal-length samples. Degenerate inputs
/// (constant series, empty slices) yield 0.
fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for k in 0..n {
        let da = a[k] - mean_a;
        let db = b[k] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    let r = cov / denom;
    if r.is_nan() {
        0.0
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_core::db::MemoryStateStore;

    fn tracker() -> DailyLossTracker {
        DailyLossTracker::new(DailyLossConfig {
            capital: Decimal::new(1_000_000, 0),
            ..DailyLossConfig::default()
        })
    }

    #[tokio::test]
    async fn test_halt_at_daily_limit() {
        let t = tracker();
        assert!(t.is_trading_allowed().await);

        // 4% down: still trading.
        assert!(!t.record_realized_pnl("trend", Decimal::new(-40_000, 0)).await);
        assert!(t.is_trading_allowed().await);

        // One more loss crosses 5%.
        assert!(t.record_realized_pnl("trend", Decimal::new(-15_000, 0)).await);
        assert!(!t.is_trading_allowed().await);

        // Halting again reports nothing new.
        assert!(!t.record_realized_pnl("trend", Decimal::new(-1_000, 0)).await);
    }

    #[tokio::test]
    async fn test_wins_offset_losses() {
        let t = tracker();
        t.record_realized_pnl("trend", Decimal::new(-40_000, 0)).await;
        t.record_realized_pnl("trend", Decimal::new(30_000, 0)).await;
        // Net -1%: another 3% loss does not cross the limit.
        assert!(!t.record_realized_pnl("trend", Decimal::new(-30_000, 0)).await);
        assert!(t.is_trading_allowed().await);
    }

    #[tokio::test]
    async fn test_check_before_trade_projects_breach() {
        let t = tracker();
        t.record_realized_pnl("trend", Decimal::new(-40_000, 0)).await;

        // A further 0.5% potential loss is fine; 1.5% would breach 5%.
        assert!(t.check_before_trade(Decimal::new(5_000, 0)).await);
        assert!(!t.check_before_trade(Decimal::new(15_000, 0)).await);
    }

    #[tokio::test]
    async fn test_drawdown_from_peak() {
        let t = tracker();
        t.update_equity(Decimal::new(1_000_000, 0)).await;
        t.update_equity(Decimal::new(1_200_000, 0)).await;
        t.update_equity(Decimal::new(1_080_000, 0)).await;

        let dd = t.drawdown_state().await;
        assert_eq!(dd.peak_equity, Decimal::new(1_200_000, 0));
        assert_eq!(dd.current_drawdown_pct, Decimal::new(10, 0));
        assert_eq!(dd.max_drawdown_pct, Decimal::new(10, 0));

        // Recovery keeps max_drawdown.
        t.update_equity(Decimal::new(1_200_000, 0)).await;
        let dd = t.drawdown_state().await;
        assert_eq!(dd.current_drawdown_pct, Decimal::ZERO);
        assert_eq!(dd.max_drawdown_pct, Decimal::new(10, 0));
    }

    #[tokio::test]
    async fn test_correlated_strategies_warn() {
        let t = DailyLossTracker::new(DailyLossConfig {
            capital: Decimal::new(1_000_000, 0),
            correlation_window: 10,
            ..DailyLossConfig::default()
        });

        // Identical return streams: correlation 1.0.
        for i in 0..10 {
            let pnl = Decimal::new(if i % 2 == 0 { 10_000 } else { -5_000 }, 0);
            t.record_realized_pnl("trend", pnl).await;
            t.record_realized_pnl("momentum", pnl).await;
        }

        let warnings = t.correlation_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].correlation > 0.99);
    }

    #[tokio::test]
    async fn test_uncorrelated_strategies_quiet() {
        let t = DailyLossTracker::new(DailyLossConfig {
            capital: Decimal::new(1_000_000, 0),
            correlation_window: 10,
            ..DailyLossConfig::default()
        });

        for i in 0..10 {
            let a = Decimal::new(if i % 2 == 0 { 10_000 } else { -10_000 }, 0);
            let b = Decimal::new(if i % 2 == 0 { -10_000 } else { 10_000 }, 0);
            t.record_realized_pnl("trend", a).await;
            t.record_realized_pnl("reversion", b).await;
        }

        assert!(t.correlation_warnings().is_empty());
    }

    #[tokio::test]
    async fn test_state_round_trips_through_store() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let t = DailyLossTracker::new(DailyLossConfig::default()).with_store(store.clone());
            t.record_realized_pnl("trend", Decimal::new(-60_000, 0)).await;
        }

        let t = DailyLossTracker::new(DailyLossConfig::default()).with_store(store);
        t.load_state().await.unwrap();
        assert!(!t.is_trading_allowed().await);
        assert_eq!(t.daily_state().await.realized_pnl, Decimal::new(-60_000, 0));
    }

    #[test]
    fn test_pearson_degenerate_inputs() {
        assert_eq!(pearson(&[], &[]), 0.0);
        assert_eq!(pearson(&[1.0], &[2.0]), 0.0);
        // Constant series has zero variance.
        assert_eq!(pearson(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]), 0.0);
    }
}
