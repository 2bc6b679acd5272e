//! Per-market evaluation engine.
//!
//! One tick per market: select the active strategy, run its signal, pass
//! every gate in order (daily loss, global breaker, market breaker, sizing
//! throttle, admission gate), submit the entry, and hand the fill to the
//! lifecycle manager. Closed-trade outcomes flow back into the breakers and
//! the daily tracker.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use risk_manager::{
    DailyLossState, DailyLossTracker, DrawdownState, GlobalBreaker, GlobalBreakerState,
    MarketBreakerBook, MarketConditionGate, PositionSizer,
};
use spot_core::api::ExchangeClient;
use spot_core::types::{
    MarketSnapshot, OrderRequest, Position, PositionStatus, TradeRecord,
};

use crate::lifecycle::{PositionLifecycleManager, TickAction};
use crate::selector::StrategySelector;

/// Supplies per-market snapshots (price, candles, indicators, regime).
/// Indicator and regime math live outside this crate.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, market: &str) -> Result<MarketSnapshot>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub markets: Vec<String>,
    /// Quote currency all markets settle in.
    pub quote_asset: String,
    pub tick_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub live_trading: bool,
    /// Explicit timeout on entry-order submission.
    pub order_timeout_secs: u64,
    /// Stop distance used for the projected daily-loss check, percent.
    pub stop_loss_pct: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            quote_asset: "KRW".to_string(),
            tick_interval_secs: 60,
            maintenance_interval_secs: 60,
            live_trading: false,
            order_timeout_secs: 10,
            stop_loss_pct: Decimal::new(5, 0),
        }
    }
}

/// What one evaluation tick did for a market.
#[derive(Debug)]
pub enum TickOutcome {
    /// No actionable signal.
    Hold,
    /// A buy signal was vetoed; the reason is operator-readable.
    Skipped(String),
    /// Entered a new position.
    Entered(Position),
    /// An existing position was monitored, closed, or abandoned.
    Position(TickAction),
}

/// Operator-facing snapshot of one market.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub market: String,
    pub breaker_open: bool,
    pub breaker_reason: Option<String>,
    pub active_strategy: Option<String>,
    /// Losing trades booked for this market in the trailing 24 hours.
    pub losses_24h: u32,
    pub position: Option<PositionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub strategy: String,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Live PnL against the last seen price, when one exists.
    pub pnl_pct: Option<Decimal>,
}

/// Full operator status surface, serializable to JSON.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub live_trading: bool,
    pub markets: Vec<MarketStatus>,
    pub global_breaker: GlobalBreakerState,
    pub daily_loss: DailyLossState,
    pub drawdown: DrawdownState,
}

pub struct TradingEngine {
    exchange: Arc<dyn ExchangeClient>,
    selector: Arc<StrategySelector>,
    lifecycle: Arc<PositionLifecycleManager>,
    breakers: Arc<MarketBreakerBook>,
    global: Arc<GlobalBreaker>,
    gate: Arc<MarketConditionGate>,
    daily: Arc<DailyLossTracker>,
    sizer: Arc<PositionSizer>,
    config: EngineConfig,
    /// Last seen price per market, for equity and status reporting.
    last_prices: DashMap<String, Decimal>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        selector: Arc<StrategySelector>,
        lifecycle: Arc<PositionLifecycleManager>,
        breakers: Arc<MarketBreakerBook>,
        global: Arc<GlobalBreaker>,
        gate: Arc<MarketConditionGate>,
        daily: Arc<DailyLossTracker>,
        sizer: Arc<PositionSizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            exchange,
            selector,
            lifecycle,
            breakers,
            global,
            gate,
            daily,
            sizer,
            config,
            last_prices: DashMap::new(),
        }
    }

    /// One evaluation tick for one market.
    pub async fn evaluate_market(
        &self,
        market: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<TickOutcome> {
        let price = snapshot.last_price;
        self.last_prices.insert(market.to_string(), price);

        let strategy = self.selector.select(market, &snapshot.regime).await;
        let signal = strategy.analyze(snapshot);

        // An open position is monitored before any entry logic runs.
        if self.lifecycle.has_open_position(market) {
            let exit_reason = signal.is_sell().then(|| signal.reason.clone());
            let action = self
                .lifecycle
                .tick(market, price, exit_reason.as_deref())
                .await?;
            if let TickAction::Closed { record, .. } = &action {
                self.record_outcome(record).await;
            }
            return Ok(TickOutcome::Position(action));
        }

        if !signal.is_buy() {
            return Ok(TickOutcome::Hold);
        }
        debug!(
            market = %market,
            strategy = strategy.name(),
            confidence = signal.confidence,
            reason = %signal.reason,
            "Buy signal"
        );

        // Can we trade at all?
        if !self.daily.is_trading_allowed().await {
            return Ok(self.veto(market, "daily loss limit reached"));
        }
        let global = self.global.can_trade().await;
        if !global.allowed {
            return Ok(self.veto(
                market,
                global.reason.as_deref().unwrap_or("global breaker open"),
            ));
        }
        // Read immediately before submission, never cached across ticks.
        let breaker = self.breakers.can_trade(market).await;
        if !breaker.allowed {
            return Ok(self.veto(
                market,
                breaker.reason.as_deref().unwrap_or("market breaker open"),
            ));
        }

        // Size the entry; the performance throttle can zero it out.
        let available = self.exchange.get_balance(&self.config.quote_asset).await?;
        let amount = self
            .sizer
            .size(market, strategy.name(), available, signal.confidence)
            .await?;
        if amount <= Decimal::ZERO {
            return Ok(self.veto(market, "sized to zero (throttle, history, or minimum)"));
        }

        // Would a full stop-out on this entry breach the daily limit?
        let potential_loss = amount * self.config.stop_loss_pct / Decimal::ONE_HUNDRED;
        if !self.daily.check_before_trade(potential_loss).await {
            return Ok(self.veto(market, "projected loss would breach daily limit"));
        }

        // Can we trade right now?
        let report = self.gate.check(market, amount, snapshot.latest_candle()).await;
        if !report.can_trade {
            let issues = report
                .issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(self.veto(market, &format!("market gate: {issues}")));
        }

        match self.submit_entry(market, amount, strategy.name(), snapshot).await? {
            Some(position) => Ok(TickOutcome::Entered(position)),
            None => Ok(self.veto(market, "entry order did not execute")),
        }
    }

    /// Operator status snapshot across all configured markets.
    pub async fn status(&self) -> EngineStatus {
        let breaker_states: std::collections::HashMap<_, _> =
            self.breakers.snapshot().into_iter().collect();

        let mut markets = Vec::with_capacity(self.config.markets.len());
        for market in &self.config.markets {
            let breaker = breaker_states.get(market.as_str());
            let position = self.lifecycle.position(market).map(|p| {
                let pnl_pct = self
                    .last_prices
                    .get(market)
                    .map(|price| p.pnl_pct(*price));
                PositionView {
                    strategy: p.strategy.clone(),
                    status: p.status,
                    entry_price: p.entry_price,
                    quantity: p.quantity,
                    pnl_pct,
                }
            });
            let losses_24h = match self.sizer.losses_last_24h(market).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(market = %market, error = %e, "Failed to count 24h losses");
                    0
                }
            };
            markets.push(MarketStatus {
                market: market.clone(),
                breaker_open: breaker.map(|b| b.is_open).unwrap_or(false),
                breaker_reason: breaker
                    .and_then(|b| b.reason)
                    .map(|r| r.describe().to_string()),
                active_strategy: self.selector.active(market).await.map(|a| a.strategy),
                losses_24h,
                position,
            });
        }

        EngineStatus {
            live_trading: self.config.live_trading,
            markets,
            global_breaker: self.global.state().await,
            daily_loss: self.daily.daily_state().await,
            drawdown: self.daily.drawdown_state().await,
        }
    }

    /// Restore durable state and run per-market loops plus the maintenance
    /// job until cancelled.
    pub async fn run(self: Arc<Self>, provider: Arc<dyn SnapshotProvider>) -> Result<()> {
        let restored = self.lifecycle.load_state(&self.config.markets).await?;
        self.daily.load_state().await?;
        self.global.load_state().await?;
        info!(
            markets = self.config.markets.len(),
            restored_positions = restored,
            live_trading = self.config.live_trading,
            "Trading engine starting"
        );

        for market in self.config.markets.clone() {
            let engine = Arc::clone(&self);
            let provider = Arc::clone(&provider);
            tokio::spawn(async move {
                let mut ticker = interval(std::time::Duration::from_secs(
                    engine.config.tick_interval_secs,
                ));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match provider.snapshot(&market).await {
                        Ok(snapshot) => {
                            if let Err(e) = engine.evaluate_market(&market, &snapshot).await {
                                error!(market = %market, error = %e, "Evaluation tick failed");
                            }
                        }
                        Err(e) => {
                            warn!(market = %market, error = %e, "Snapshot unavailable");
                            engine.global.record_api_error(&market).await;
                        }
                    }
                }
            });
        }

        self.maintenance_loop().await
    }

    // Private methods

    fn veto(&self, market: &str, reason: &str) -> TickOutcome {
        info!(market = %market, reason = %reason, "Entry vetoed");
        TickOutcome::Skipped(reason.to_string())
    }

    async fn submit_entry(
        &self,
        market: &str,
        amount: Decimal,
        strategy: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<Option<Position>> {
        let book = self.exchange.get_order_book(market).await?;
        let Some(best_ask) = book.best_ask() else {
            self.breakers
                .record_execution_failure(market, "order book empty at submission")
                .await?;
            return Ok(None);
        };
        let expected = best_ask.price;
        let precision = self.exchange.quantity_precision(market);

        let (fill_price, quantity) = if self.config.live_trading {
            let request = OrderRequest::market_buy(market, amount);
            let timeout = std::time::Duration::from_secs(self.config.order_timeout_secs);
            match tokio::time::timeout(timeout, self.exchange.submit_order(&request)).await {
                Ok(Ok(submitted)) => match self.exchange.get_order(&submitted.order_id).await {
                    Ok(detail) if detail.executed_quantity > Decimal::ZERO => (
                        detail.avg_fill_price.unwrap_or(expected),
                        detail.executed_quantity,
                    ),
                    // Fill details unavailable yet; book against the
                    // expected price.
                    Ok(_) | Err(_) => (
                        expected,
                        (amount / expected)
                            .round_dp_with_strategy(precision, RoundingStrategy::ToZero),
                    ),
                },
                Ok(Err(e)) => {
                    self.breakers
                        .record_execution_failure(market, &e.to_string())
                        .await?;
                    return Ok(None);
                }
                Err(_) => {
                    self.breakers
                        .record_execution_failure(market, "entry order timed out")
                        .await?;
                    return Ok(None);
                }
            }
        } else {
            info!(
                market = %market,
                amount = %amount,
                price = %expected,
                "[PAPER] Simulated entry fill"
            );
            (
                expected,
                (amount / expected).round_dp_with_strategy(precision, RoundingStrategy::ToZero),
            )
        };

        if quantity <= Decimal::ZERO {
            return Ok(None);
        }
        self.breakers.record_execution_success(market).await?;

        // Entry slippage versus the best ask observed before submission.
        if expected > Decimal::ZERO {
            let slippage_pct = (fill_price - expected) / expected * Decimal::ONE_HUNDRED;
            self.breakers.record_slippage(market, slippage_pct).await?;
        }

        let position = self
            .lifecycle
            .open_position(
                market,
                fill_price,
                quantity,
                strategy,
                snapshot.regime.regime,
            )
            .await?;
        Ok(Some(position))
    }

    async fn record_outcome(&self, record: &TradeRecord) {
        if let Err(e) = self
            .breakers
            .record_trade_result(&record.market, record.pnl_pct)
            .await
        {
            error!(market = %record.market, error = %e, "Failed to record trade result");
        }
        self.daily
            .record_realized_pnl(&record.strategy, record.pnl)
            .await;
    }

    /// Idempotent housekeeping, safe to run beside the market loops: daily
    /// rollover, API-error window pruning, and equity tracking.
    async fn maintenance_loop(&self) -> Result<()> {
        let mut ticker = interval(std::time::Duration::from_secs(
            self.config.maintenance_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_date = self.daily.daily_state().await.date;

        loop {
            ticker.tick().await;

            self.daily.roll_day_if_needed().await;
            let date = self.daily.daily_state().await.date;
            if date != last_date {
                info!(date = %date, "Daily boundary crossed, resetting breaker daily counters");
                self.breakers.reset_daily().await;
                last_date = date;
            }

            self.global.prune_api_errors().await;

            if let Err(e) = self.update_equity().await {
                warn!(error = %e, "Equity update failed");
            }
        }
    }

    /// Total tracked assets: quote balance plus open positions at their last
    /// seen prices. Feeds drawdown tracking on both risk layers.
    async fn update_equity(&self) -> Result<()> {
        let balances = self.exchange.get_balances().await?;
        let mut equity = balances
            .iter()
            .find(|b| b.asset == self.config.quote_asset)
            .map(|b| b.total())
            .unwrap_or(Decimal::ZERO);

        for position in self.lifecycle.open_positions() {
            if let Some(price) = self.last_prices.get(&position.market) {
                equity += position.quantity * *price;
            }
        }

        self.daily.update_equity(equity).await;
        self.global.record_total_asset(equity).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleConfig;
    use crate::selector::SelectorConfig;
    use crate::strategy::default_strategies;
    use chrono::Utc;
    use risk_manager::{
        BreakerConfig, DailyLossConfig, GateConfig, GlobalBreakerConfig, SizerConfig,
    };
    use spot_core::db::{MemoryTradeLedger, TradeLedger};
    use spot_core::types::{
        Balance, Candle, IndicatorSet, MarketRegime, OrderBook, OrderBookLevel, OrderDetail,
        RegimeSample, SubmittedOrder,
    };
    use spot_core::{Error, Result as CoreResult};
    use std::sync::Mutex;

    struct FakeExchange {
        book: Mutex<OrderBook>,
        krw: Mutex<Decimal>,
    }

    impl FakeExchange {
        fn new(ask_price: i64, depth: i64, krw: i64) -> Self {
            Self {
                book: Mutex::new(OrderBook {
                    market: "KRW-BTC".to_string(),
                    bids: vec![OrderBookLevel {
                        price: Decimal::new(ask_price - 1, 0),
                        size: Decimal::new(depth, 0),
                    }],
                    asks: vec![OrderBookLevel {
                        price: Decimal::new(ask_price, 0),
                        size: Decimal::new(depth, 0),
                    }],
                    timestamp: Utc::now(),
                }),
                krw: Mutex::new(Decimal::new(krw, 0)),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn get_order_book(&self, _market: &str) -> CoreResult<OrderBook> {
            Ok(self.book.lock().unwrap().clone())
        }

        async fn get_balances(&self) -> CoreResult<Vec<Balance>> {
            Ok(vec![Balance {
                asset: "KRW".to_string(),
                available: *self.krw.lock().unwrap(),
                locked: Decimal::ZERO,
            }])
        }

        async fn submit_order(&self, _request: &OrderRequest) -> CoreResult<SubmittedOrder> {
            Err(Error::Order {
                message: "paper tests never submit".to_string(),
            })
        }

        async fn cancel_order(&self, _order_id: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn get_order(&self, _order_id: &str) -> CoreResult<OrderDetail> {
            Err(Error::Order {
                message: "paper tests never submit".to_string(),
            })
        }
    }

    fn bull_snapshot(price: i64) -> MarketSnapshot {
        MarketSnapshot {
            market: "KRW-BTC".to_string(),
            last_price: Decimal::new(price, 0),
            candles: vec![Candle {
                market: "KRW-BTC".to_string(),
                open: Decimal::new(price, 0),
                high: Decimal::new(price + 1, 0),
                low: Decimal::new(price - 1, 0),
                close: Decimal::new(price, 0),
                volume: Decimal::ONE,
                timestamp: Utc::now(),
            }],
            indicators: IndicatorSet {
                rsi: Some(55.0),
                macd: Some(3.0),
                macd_signal: Some(1.0),
                ..IndicatorSet::default()
            },
            regime: RegimeSample::new(MarketRegime::BullTrend, 30.0, 1.0, 0.9),
            taken_at: Utc::now(),
        }
    }

    fn sell_snapshot(price: i64) -> MarketSnapshot {
        let mut snap = bull_snapshot(price);
        snap.indicators.macd = Some(1.0);
        snap.indicators.macd_signal = Some(2.0);
        snap
    }

    struct Stack {
        engine: TradingEngine,
        ledger: Arc<MemoryTradeLedger>,
        breakers: Arc<MarketBreakerBook>,
        daily: Arc<DailyLossTracker>,
    }

    fn stack(exchange: Arc<FakeExchange>) -> Stack {
        let ledger = Arc::new(MemoryTradeLedger::new());
        let global = Arc::new(GlobalBreaker::new(GlobalBreakerConfig::default()));
        let breakers = Arc::new(
            MarketBreakerBook::new(BreakerConfig::default()).with_global(global.clone()),
        );
        let daily = Arc::new(DailyLossTracker::new(DailyLossConfig {
            capital: Decimal::new(1_000_000, 0),
            ..DailyLossConfig::default()
        }));
        let engine = TradingEngine::new(
            exchange.clone(),
            Arc::new(StrategySelector::new(
                SelectorConfig::default(),
                default_strategies(),
            )),
            Arc::new(
                PositionLifecycleManager::new(
                    exchange.clone(),
                    LifecycleConfig {
                        close_retry_delay_secs: 0,
                        ..LifecycleConfig::default()
                    },
                )
                .with_ledger(ledger.clone()),
            ),
            breakers.clone(),
            global,
            Arc::new(MarketConditionGate::new(exchange, GateConfig::default())),
            daily.clone(),
            Arc::new(PositionSizer::new(ledger.clone(), SizerConfig::default())),
            EngineConfig {
                markets: vec!["KRW-BTC".to_string()],
                ..EngineConfig::default()
            },
        );
        Stack {
            engine,
            ledger,
            breakers,
            daily,
        }
    }

    /// Drive the selector through its confirmation window.
    async fn warm_up(stack: &Stack) {
        for _ in 0..2 {
            stack
                .engine
                .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_paper_entry_flow() {
        let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;

        let outcome = s
            .engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();
        match outcome {
            TickOutcome::Entered(position) => {
                assert_eq!(position.entry_price, Decimal::new(10_000, 0));
                assert!(position.quantity > Decimal::ZERO);
                assert_eq!(position.strategy, "trend_follow");
            }
            other => panic!("expected Entered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sell_signal_closes_and_feeds_ledger() {
        let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;
        s.engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();

        // MACD crosses down 3% higher; the strategy exits.
        let outcome = s
            .engine
            .evaluate_market("KRW-BTC", &sell_snapshot(10_300))
            .await
            .unwrap();
        match outcome {
            TickOutcome::Position(TickAction::Closed { record, .. }) => {
                assert!(record.pnl > Decimal::ZERO);
            }
            other => panic!("expected Closed, got {other:?}"),
        }

        let trades = s.ledger.recent(Some("KRW-BTC"), None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "strategy_exit");
        assert!(s.daily.daily_state().await.realized_pnl > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_breaker_vetoes_entry() {
        let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;
        s.breakers.manual_trip("KRW-BTC", None).await;

        let outcome = s
            .engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();
        match outcome {
            TickOutcome::Skipped(reason) => assert!(reason.contains("manual")),
            other => panic!("expected Skipped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_daily_halt_vetoes_entry() {
        let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;
        s.daily
            .record_realized_pnl("trend_follow", Decimal::new(-60_000, 0))
            .await;

        let outcome = s
            .engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::Skipped(ref r) if r.contains("daily")));
    }

    #[tokio::test]
    async fn test_thin_book_vetoes_entry() {
        // Depth 1 unit at 10,000 is 10,000 quote; a ~7,000 order needs 3x.
        let exchange = Arc::new(FakeExchange::new(10_000, 1, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;

        let outcome = s
            .engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::Skipped(ref r) if r.contains("gate")));
    }

    #[tokio::test]
    async fn test_status_snapshot_serializes() {
        let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
        let s = stack(exchange);
        warm_up(&s).await;
        s.engine
            .evaluate_market("KRW-BTC", &bull_snapshot(10_000))
            .await
            .unwrap();

        let status = s.engine.status().await;
        assert_eq!(status.markets.len(), 1);
        assert_eq!(
            status.markets[0].active_strategy.as_deref(),
            Some("trend_follow")
        );
        assert!(status.markets[0].position.is_some());
        assert_eq!(status.markets[0].losses_24h, 0);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"live_trading\":false"));
        assert!(json.contains("\"losses_24h\":0"));
    }
}
