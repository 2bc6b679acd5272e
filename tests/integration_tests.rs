//! Integration tests for component interactions.
//!
//! These tests wire the real risk components together around a scripted
//! exchange and verify that trade outcomes flow across crate boundaries:
//! lifecycle closes feed the ledger, the ledger feeds sizing, and realized
//! losses feed the breakers and the daily tracker.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use risk_manager::{
    BreakerConfig, DailyLossConfig, DailyLossTracker, GateConfig, GlobalBreaker,
    GlobalBreakerConfig, MarketBreakerBook, MarketConditionGate, PositionSizer, SizerConfig,
};
use spot_core::api::ExchangeClient;
use spot_core::db::{MemoryStateStore, MemoryTradeLedger, TradeLedger};
use spot_core::types::{
    Balance, Candle, IndicatorSet, MarketRegime, MarketSnapshot, OrderBook, OrderBookLevel,
    OrderDetail, OrderRequest, RegimeSample, SubmittedOrder, TradeRecord,
};
use spot_core::{Error, Result as CoreResult};
use trading_engine::{
    default_strategies, EngineConfig, LifecycleConfig, PositionLifecycleManager, SelectorConfig,
    StrategySelector, TickAction, TickOutcome, TradingEngine,
};

/// Paper-mode exchange: a static order book and a fixed quote balance.
/// Order submission is unreachable in these tests and returns an error.
struct FakeExchange {
    book: Mutex<OrderBook>,
    krw: Decimal,
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
            krw: Decimal::new(krw, 0),
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
            available: self.krw,
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

fn snapshot(price: i64) -> MarketSnapshot {
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

struct Stack {
    engine: Arc<TradingEngine>,
    ledger: Arc<MemoryTradeLedger>,
    breakers: Arc<MarketBreakerBook>,
    lifecycle: Arc<PositionLifecycleManager>,
    selector: Arc<StrategySelector>,
    daily: Arc<DailyLossTracker>,
}

/// A full paper-trading stack. When a store is supplied, every stateful
/// component persists through it, so two stacks sharing one store behave
/// like a process restart.
fn stack(exchange: Arc<FakeExchange>, store: Option<Arc<MemoryStateStore>>) -> Stack {
    let ledger = Arc::new(MemoryTradeLedger::new());
    let mut global = GlobalBreaker::new(GlobalBreakerConfig::default());
    let mut breakers = MarketBreakerBook::new(BreakerConfig::default());
    let mut daily = DailyLossTracker::new(DailyLossConfig {
        capital: Decimal::new(1_000_000, 0),
        ..DailyLossConfig::default()
    });
    let mut selector = StrategySelector::new(SelectorConfig::default(), default_strategies());
    let mut lifecycle = PositionLifecycleManager::new(
        exchange.clone(),
        LifecycleConfig {
            close_retry_delay_secs: 0,
            ..LifecycleConfig::default()
        },
    )
    .with_ledger(ledger.clone());

    if let Some(store) = store {
        global = global.with_store(store.clone());
        breakers = breakers.with_store(store.clone());
        daily = daily.with_store(store.clone());
        selector = selector.with_store(store.clone());
        lifecycle = lifecycle.with_store(store);
    }

    let global = Arc::new(global);
    let breakers = Arc::new(breakers.with_global(global.clone()));
    let daily = Arc::new(daily);
    let selector = Arc::new(selector);
    let lifecycle = Arc::new(lifecycle);

    let engine = Arc::new(TradingEngine::new(
        exchange.clone(),
        selector.clone(),
        lifecycle.clone(),
        breakers.clone(),
        global,
        Arc::new(MarketConditionGate::new(exchange, GateConfig::default())),
        daily.clone(),
        Arc::new(PositionSizer::new(ledger.clone(), SizerConfig::default())),
        EngineConfig {
            markets: vec!["KRW-BTC".to_string()],
            ..EngineConfig::default()
        },
    ));

    Stack {
        engine,
        ledger,
        breakers,
        lifecycle,
        selector,
        daily,
    }
}

/// Drive the selector through its confirmation window so the next bull
/// snapshot runs the trend strategy.
async fn warm_up(stack: &Stack) {
    for _ in 0..2 {
        stack
            .engine
            .evaluate_market("KRW-BTC", &snapshot(10_000))
            .await
            .unwrap();
    }
}

fn record(pnl: i64, minutes_ago: i64) -> TradeRecord {
    let exited_at = Utc::now() - Duration::minutes(minutes_ago);
    TradeRecord {
        id: Uuid::new_v4(),
        market: "KRW-BTC".to_string(),
        strategy: "trend_follow".to_string(),
        entry_price: Decimal::new(10_000, 0),
        exit_price: Decimal::new(10_000 + pnl, 0),
        quantity: Decimal::ONE,
        pnl: Decimal::new(pnl, 0),
        pnl_pct: Decimal::new(pnl, 2),
        entered_at: exited_at - Duration::hours(1),
        exited_at,
        exit_reason: "strategy_exit".to_string(),
    }
}

/// Three stopped-out round trips in a row must trip the market breaker,
/// and the breaker must veto the next entry with the trip reason.
#[tokio::test]
async fn test_losing_run_trips_market_breaker() {
    let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
    let s = stack(exchange, None);
    warm_up(&s).await;

    for round in 0..3 {
        let entered = s
            .engine
            .evaluate_market("KRW-BTC", &snapshot(10_000))
            .await
            .unwrap();
        assert!(
            matches!(entered, TickOutcome::Entered(_)),
            "round {round}: expected entry, got {entered:?}"
        );

        // 6% below entry is through the 5% stop.
        let closed = s
            .engine
            .evaluate_market("KRW-BTC", &snapshot(9_400))
            .await
            .unwrap();
        match closed {
            TickOutcome::Position(TickAction::Closed { record, .. }) => {
                assert!(record.pnl < Decimal::ZERO);
            }
            other => panic!("round {round}: expected Closed, got {other:?}"),
        }
    }

    let outcome = s
        .engine
        .evaluate_market("KRW-BTC", &snapshot(10_000))
        .await
        .unwrap();
    match outcome {
        TickOutcome::Skipped(reason) => assert!(reason.contains("consecutive losses")),
        other => panic!("expected Skipped, got {other:?}"),
    }

    // Each round trip reached the ledger and the daily tracker.
    let trades = s.ledger.recent(Some("KRW-BTC"), None, 10).await.unwrap();
    assert_eq!(trades.len(), 3);
    assert!(trades.iter().all(|t| t.exit_reason == "stop_loss"));
    assert!(s.daily.daily_state().await.realized_pnl < Decimal::ZERO);

    // The status surface reports the same losses.
    let status = s.engine.status().await;
    assert_eq!(status.markets[0].losses_24h, 3);
}

/// Breaker trips, the active strategy selection, and the open position all
/// survive a restart through the shared durable store.
#[tokio::test]
async fn test_risk_state_survives_restart() {
    let store = Arc::new(MemoryStateStore::new());
    let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));

    {
        let s = stack(exchange.clone(), Some(store.clone()));
        warm_up(&s).await;
        let entered = s
            .engine
            .evaluate_market("KRW-BTC", &snapshot(10_000))
            .await
            .unwrap();
        assert!(matches!(entered, TickOutcome::Entered(_)));

        for _ in 0..3 {
            s.breakers
                .record_trade_result("KRW-ETH", Decimal::new(-1, 0))
                .await
                .unwrap();
        }
        assert!(!s.breakers.can_trade("KRW-ETH").await.allowed);
    }

    // Fresh stack, same store: a simulated process restart.
    let s = stack(exchange, Some(store));
    let markets = vec!["KRW-BTC".to_string(), "KRW-ETH".to_string()];
    let restored = s.lifecycle.load_state(&markets).await.unwrap();
    assert_eq!(restored, 1);
    assert!(s.lifecycle.has_open_position("KRW-BTC"));

    let decision = s.breakers.can_trade("KRW-ETH").await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("consecutive losses"));

    let active = s.selector.active("KRW-BTC").await.unwrap();
    assert_eq!(active.strategy, "trend_follow");
}

/// Ten ledger records ending in a five-loss streak must zero out sizing
/// entirely, independent of the circuit breakers.
#[tokio::test]
async fn test_loss_streak_disables_sizing() {
    let ledger = Arc::new(MemoryTradeLedger::new());
    // Older wins, then five consecutive losses as the most recent trades.
    for i in 0..5 {
        ledger.append(&record(600, 100 + i)).await.unwrap();
    }
    for i in 0..5 {
        ledger.append(&record(-600, 10 + i)).await.unwrap();
    }

    let sizer = PositionSizer::new(ledger, SizerConfig::default());
    let amount = sizer
        .size("KRW-BTC", "trend_follow", Decimal::new(1_000_000, 0), 70.0)
        .await
        .unwrap();
    assert_eq!(amount, Decimal::ZERO);

    let throttle = sizer.throttle("KRW-BTC", "trend_follow").await.unwrap();
    assert!(throttle.block_new_buys);
    assert_eq!(throttle.recent_consecutive_losses, 5);
}

/// A daily halt taken in one process is still in force after a same-day
/// restart.
#[tokio::test]
async fn test_daily_halt_persists_within_day() {
    let store = Arc::new(MemoryStateStore::new());
    let config = DailyLossConfig {
        capital: Decimal::new(1_000_000, 0),
        ..DailyLossConfig::default()
    };

    {
        let daily = DailyLossTracker::new(config.clone()).with_store(store.clone());
        // 6% of capital, past the 5% limit.
        let halted = daily
            .record_realized_pnl("trend_follow", Decimal::new(-60_000, 0))
            .await;
        assert!(halted);
        assert!(!daily.is_trading_allowed().await);
    }

    let daily = DailyLossTracker::new(config).with_store(store);
    daily.load_state().await.unwrap();
    assert!(!daily.is_trading_allowed().await);
    assert!(daily.daily_state().await.trading_halted);
}

/// A manual breaker trip shows up on the operator status surface.
#[tokio::test]
async fn test_status_reflects_manual_trip() {
    let exchange = Arc::new(FakeExchange::new(10_000, 100, 1_000_000));
    let s = stack(exchange, None);
    warm_up(&s).await;
    s.breakers
        .manual_trip("KRW-BTC", Some("incident response".to_string()))
        .await;

    let status = s.engine.status().await;
    assert_eq!(status.markets.len(), 1);
    assert!(status.markets[0].breaker_open);
    assert_eq!(
        status.markets[0].breaker_reason.as_deref(),
        Some("manual trip")
    );

    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("manual"));
}
