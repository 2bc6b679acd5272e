//! Pre-trade market-condition gate.
//!
//! Every entry passes through the gate after risk checks and before order
//! submission: spread, ask-side liquidity against the intended amount, and
//! API health for the market. Volatility is reported but never blocks.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use spot_core::api::ExchangeClient;
use spot_core::types::Candle;

use crate::global_breaker::GlobalBreaker;

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum bid/ask spread, percent.
    pub max_spread_pct: Decimal,
    /// Ask depth must cover the intended amount this many times over.
    pub min_liquidity_ratio: Decimal,
    /// Current-candle range above this is flagged (advisory).
    pub volatility_warn_pct: Decimal,
    /// Order-book levels counted toward depth.
    pub depth_levels: usize,
    /// Consecutive order-book fetch failures before the market is
    /// considered API-unhealthy.
    pub max_consecutive_api_errors: u32,
    pub api_error_cooldown_minutes: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: Decimal::new(5, 1), // 0.5%
            min_liquidity_ratio: Decimal::new(3, 0),
            volatility_warn_pct: Decimal::new(2, 0),
            depth_levels: 5,
            max_consecutive_api_errors: 3,
            api_error_cooldown_minutes: 10,
        }
    }
}

/// One condition the gate found. Only blocking issues reject the trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GateIssue {
    SpreadTooWide { spread_pct: Decimal },
    LiquidityInsufficient { ratio: Decimal },
    HighVolatility { range_pct: Decimal },
    ApiUnhealthy,
    EmptyOrderBook,
}

impl GateIssue {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, GateIssue::HighVolatility { .. })
    }
}

impl fmt::Display for GateIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateIssue::SpreadTooWide { spread_pct } => {
                write!(f, "spread too wide ({spread_pct}%)")
            }
            GateIssue::LiquidityInsufficient { ratio } => {
                write!(f, "ask depth only {ratio}x the intended amount")
            }
            GateIssue::HighVolatility { range_pct } => {
                write!(f, "current candle range {range_pct}%")
            }
            GateIssue::ApiUnhealthy => write!(f, "market API unhealthy"),
            GateIssue::EmptyOrderBook => write!(f, "order book empty"),
        }
    }
}

/// Raw measurements behind a gate decision, for the status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateMetrics {
    pub spread_pct: Option<Decimal>,
    pub ask_depth: Option<Decimal>,
    pub liquidity_ratio: Option<Decimal>,
    pub imbalance: Option<Decimal>,
    pub candle_range_pct: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub can_trade: bool,
    pub issues: Vec<GateIssue>,
    pub metrics: GateMetrics,
}

impl GateReport {
    fn rejected(issue: GateIssue, metrics: GateMetrics) -> Self {
        Self {
            can_trade: false,
            issues: vec![issue],
            metrics,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ApiHealth {
    consecutive_errors: u32,
    blocked_until: Option<DateTime<Utc>>,
}

pub struct MarketConditionGate {
    exchange: Arc<dyn ExchangeClient>,
    config: GateConfig,
    health: DashMap<String, ApiHealth>,
    global: Option<Arc<GlobalBreaker>>,
}

impl MarketConditionGate {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: GateConfig) -> Self {
        Self {
            exchange,
            config,
            health: DashMap::new(),
            global: None,
        }
    }

    /// Forward order-book fetch failures into the global breaker's
    /// API-error window.
    pub fn with_global(mut self, global: Arc<GlobalBreaker>) -> Self {
        self.global = Some(global);
        self
    }

    /// Check whether a buy of `intended_amount` (quote currency) is
    /// admissible on `market` right now. `minute_candle` is the live
    /// one-minute candle when the caller has one.
    pub async fn check(
        &self,
        market: &str,
        intended_amount: Decimal,
        minute_candle: Option<&Candle>,
    ) -> GateReport {
        let mut metrics = GateMetrics::default();

        if self.api_blocked(market) {
            return GateReport::rejected(GateIssue::ApiUnhealthy, metrics);
        }

        let book = match self.exchange.get_order_book(market).await {
            Ok(book) => {
                self.record_api_success(market);
                book
            }
            Err(e) => {
                warn!(market = %market, error = %e, "Order book fetch failed");
                self.record_api_error(market).await;
                return GateReport::rejected(GateIssue::ApiUnhealthy, metrics);
            }
        };

        if book.asks.is_empty() || book.bids.is_empty() {
            return GateReport::rejected(GateIssue::EmptyOrderBook, metrics);
        }

        let mut issues = Vec::new();

        metrics.spread_pct = book.spread_pct();
        if let Some(spread) = metrics.spread_pct {
            if spread > self.config.max_spread_pct {
                issues.push(GateIssue::SpreadTooWide { spread_pct: spread });
            }
        }

        // A buy consumes asks, so depth is measured on the ask side.
        let depth = book.ask_depth(self.config.depth_levels);
        metrics.ask_depth = Some(depth);
        metrics.imbalance = Some(book.imbalance(self.config.depth_levels));
        if intended_amount > Decimal::ZERO {
            let ratio = depth / intended_amount;
            metrics.liquidity_ratio = Some(ratio);
            if ratio < self.config.min_liquidity_ratio {
                issues.push(GateIssue::LiquidityInsufficient { ratio });
            }
        }

        if let Some(candle) = minute_candle {
            let range = candle.range_pct();
            metrics.candle_range_pct = Some(range);
            if range > self.config.volatility_warn_pct {
                issues.push(GateIssue::HighVolatility { range_pct: range });
            }
        }

        let can_trade = !issues.iter().any(GateIssue::is_blocking);
        if !can_trade {
            debug!(market = %market, issues = ?issues, "Gate rejected entry");
        }
        GateReport {
            can_trade,
            issues,
            metrics,
        }
    }

    // Private methods

    fn api_blocked(&self, market: &str) -> bool {
        self.health
            .get(market)
            .and_then(|h| h.blocked_until)
            .map(|until| Utc::now() < until)
            .unwrap_or(false)
    }

    fn record_api_success(&self, market: &str) {
        if let Some(mut h) = self.health.get_mut(market) {
            h.consecutive_errors = 0;
            h.blocked_until = None;
        }
    }

    async fn record_api_error(&self, market: &str) {
        let newly_blocked = {
            let mut h = self.health.entry(market.to_string()).or_default();
            h.consecutive_errors += 1;
            if h.consecutive_errors >= self.config.max_consecutive_api_errors
                && h.blocked_until.is_none()
            {
                h.blocked_until =
                    Some(Utc::now() + Duration::minutes(self.config.api_error_cooldown_minutes));
                true
            } else {
                false
            }
        };
        if newly_blocked {
            warn!(
                market = %market,
                cooldown_minutes = self.config.api_error_cooldown_minutes,
                "Market API marked unhealthy"
            );
        }

        if let Some(global) = &self.global {
            global.record_api_error(market).await;
        }
    }
}
