//! Position lifecycle management.
//!
//! One position per market, driven through OPEN → CLOSING → CLOSED or
//! ABANDONED. Every exit reconciles the recorded quantity against the live
//! exchange balance before selling, retries failed exits on a fixed backoff
//! up to a bounded attempt count, and persists every transition so a restart
//! resumes from durable state.
//!
//! A timed-out exit order is never assumed to have failed: the outcome is
//! re-verified against the exchange (order status, then balance) and only a
//! definite non-execution reverts CLOSING back to OPEN.

use anyhow::{bail, Result};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use spot_core::api::ExchangeClient;
use spot_core::db::{StateStore, TradeLedger};
use spot_core::notify::{AlertKind, AlertSink, NullSink};
use spot_core::types::{
    MarketRegime, OrderRequest, Position, PositionStatus, TradeRecord,
};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Hard stop below entry, percent.
    pub stop_loss_pct: Decimal,
    /// Take profit above entry, percent.
    pub take_profit_pct: Decimal,
    /// Profit that arms the trailing stop, percent of entry.
    pub trailing_activation_pct: Decimal,
    /// Retrace from the trailing peak that fires the stop, percent.
    pub trailing_offset_pct: Decimal,
    pub max_holding_hours: i64,
    pub max_close_attempts: u32,
    pub close_retry_delay_secs: u64,
    /// Explicit timeout on exit-order submission.
    pub order_timeout_secs: u64,
    /// When false, exits are simulated at the current price instead of
    /// submitted to the exchange.
    pub live_trading: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: Decimal::new(5, 0),
            take_profit_pct: Decimal::new(10, 0),
            trailing_activation_pct: Decimal::new(5, 0),
            trailing_offset_pct: Decimal::new(2, 0),
            max_holding_hours: 72,
            max_close_attempts: 5,
            close_retry_delay_secs: 10,
            order_timeout_secs: 10,
            live_trading: false,
        }
    }
}

/// Why a position was exited, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    StrategyExit,
    MaxHoldingTime,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::StrategyExit => "strategy_exit",
            ExitReason::MaxHoldingTime => "max_holding_time",
        };
        write!(f, "{s}")
    }
}

/// What a monitoring tick did with a market's position.
#[derive(Debug, Clone)]
pub enum TickAction {
    /// No active position on this market.
    Idle,
    /// Position held; no exit trigger fired.
    Holding { pnl_pct: Decimal },
    /// Position fully settled this tick.
    Closed {
        reason: ExitReason,
        record: TradeRecord,
    },
    /// Retries exhausted or nothing left to sell.
    Abandoned { detail: String },
}

enum AttemptOutcome {
    Executed { fill_price: Decimal, quantity: Decimal },
    /// The order definitively did not execute.
    Failed(String),
    /// Could not confirm either way yet.
    Unknown(String),
}

pub struct PositionLifecycleManager {
    exchange: Arc<dyn ExchangeClient>,
    config: LifecycleConfig,
    /// Active position per market. Terminal positions are removed.
    positions: DashMap<String, Position>,
    store: Option<Arc<dyn StateStore>>,
    ledger: Option<Arc<dyn TradeLedger>>,
    alerts: Arc<dyn AlertSink>,
}

impl PositionLifecycleManager {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: LifecycleConfig) -> Self {
        Self {
            exchange,
            config,
            positions: DashMap::new(),
            store: None,
            ledger: None,
            alerts: Arc::new(NullSink),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn TradeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Restore persisted positions for the given markets on startup.
    /// A position persisted mid-CLOSING resumes as CLOSING and is resolved
    /// on its next tick.
    pub async fn load_state(&self, markets: &[String]) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = 0;
        for market in markets {
            let Some(raw) = store.get(&position_key(market)).await? else {
                continue;
            };
            match serde_json::from_str::<Position>(&raw) {
                Ok(position) if position.is_active() => {
                    info!(
                        market = %market,
                        status = ?position.status,
                        quantity = %position.quantity,
                        "Restored position"
                    );
                    self.positions.insert(market.clone(), position);
                    restored += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(market = %market, error = %e, "Corrupt position state, ignoring"),
            }
        }
        Ok(restored)
    }

    /// Record a confirmed entry fill as a new open position.
    pub async fn open_position(
        &self,
        market: &str,
        entry_price: Decimal,
        quantity: Decimal,
        strategy: &str,
        regime: MarketRegime,
    ) -> Result<Position> {
        if self.positions.contains_key(market) {
            bail!("market {market} already has an active position");
        }
        if entry_price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            bail!("degenerate entry for {market}: price {entry_price}, quantity {quantity}");
        }

        let pct = Decimal::ONE_HUNDRED;
        let position = Position::new(
            market.to_string(),
            entry_price,
            quantity,
            entry_price * (pct - self.config.stop_loss_pct) / pct,
            entry_price * (pct + self.config.take_profit_pct) / pct,
            strategy.to_string(),
            regime,
        );
        info!(
            market = %market,
            entry_price = %entry_price,
            quantity = %quantity,
            stop_loss = %position.stop_loss_price,
            take_profit = %position.take_profit_price,
            strategy = %strategy,
            "Opened position"
        );

        self.positions.insert(market.to_string(), position.clone());
        self.persist(&position).await;
        Ok(position)
    }

    pub fn has_open_position(&self, market: &str) -> bool {
        self.positions.contains_key(market)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn position(&self, market: &str) -> Option<Position> {
        self.positions.get(market).map(|p| p.clone())
    }

    /// One monitoring tick: update the trailing peak, evaluate exit triggers
    /// in priority order, and run the close flow when one fires.
    ///
    /// `strategy_exit` carries the active strategy's SELL reason, if any.
    pub async fn tick(
        &self,
        market: &str,
        current_price: Decimal,
        strategy_exit: Option<&str>,
    ) -> Result<TickAction> {
        // Trailing-peak update and trigger evaluation are synchronous; the
        // close flow below re-takes ownership of the position.
        let trigger = {
            let Some(mut entry) = self.positions.get_mut(market) else {
                return Ok(TickAction::Idle);
            };
            let position = entry.value_mut();

            // A position stuck in CLOSING from a crashed run resumes its
            // exit here.
            if position.status == PositionStatus::Closing {
                Some(ExitReason::StrategyExit)
            } else {
                let pnl = position.pnl_pct(current_price);
                if position.trailing_peak.is_some()
                    || pnl >= self.config.trailing_activation_pct
                {
                    position.update_trailing_peak(current_price);
                }
                self.exit_trigger(position, current_price, strategy_exit)
            }
        };

        let Some(reason) = trigger else {
            let pnl_pct = self
                .positions
                .get(market)
                .map(|p| p.pnl_pct(current_price))
                .unwrap_or(Decimal::ZERO);
            return Ok(TickAction::Holding { pnl_pct });
        };

        self.close(market, current_price, reason).await
    }

    /// Close flow: reconcile, submit, verify, retry, and settle or abandon.
    pub async fn close(
        &self,
        market: &str,
        current_price: Decimal,
        reason: ExitReason,
    ) -> Result<TickAction> {
        // Claim the position so no second exit can start for this market.
        let Some((_, mut position)) = self.positions.remove(market) else {
            return Ok(TickAction::Idle);
        };
        info!(market = %market, reason = %reason, "Closing position");

        let result = self.run_close(&mut position, current_price, reason).await;
        if result.is_err() {
            // A transient error must not lose track of live exposure. The
            // position goes back into the map and the next tick resumes the
            // close from its last persisted status.
            self.positions.insert(market.to_string(), position);
        }
        result
    }

    // Private methods

    async fn run_close(
        &self,
        position: &mut Position,
        current_price: Decimal,
        reason: ExitReason,
    ) -> Result<TickAction> {
        let market = position.market.clone();

        if !self.config.live_trading {
            let quantity = position.quantity;
            if position.status != PositionStatus::Closing {
                position.mark_closing().map_err(anyhow::Error::msg)?;
                self.persist(position).await;
            }
            info!(market = %market, quantity = %quantity, "[PAPER] Simulated exit fill");
            return self.settle(position, reason, current_price, quantity).await;
        }

        loop {
            if position.close_attempts >= self.config.max_close_attempts {
                return Ok(self
                    .abandon(position, "exit retries exhausted")
                    .await);
            }

            // Reconcile against the authoritative exchange balance before
            // every attempt.
            let actual = self.exchange.get_balance(position.base_asset()).await?;
            if actual <= Decimal::ZERO {
                return Ok(self
                    .abandon(position, "exchange balance is zero, nothing to sell")
                    .await);
            }
            if actual < position.quantity {
                warn!(
                    market = %market,
                    recorded = %position.quantity,
                    actual = %actual,
                    "Recorded quantity exceeds exchange balance, selling the lesser"
                );
            }
            let precision = self.exchange.quantity_precision(&market);
            let sell_qty = position
                .quantity
                .min(actual)
                .round_dp_with_strategy(precision, RoundingStrategy::ToZero);
            if sell_qty * current_price < self.exchange.min_order_amount() {
                return Ok(self
                    .abandon(position, "remaining quantity below exchange minimum")
                    .await);
            }

            if position.status != PositionStatus::Closing {
                position
                    .mark_closing()
                    .map_err(anyhow::Error::msg)?;
                self.persist(position).await;
            }

            match self.attempt_exit(position, sell_qty, current_price).await {
                AttemptOutcome::Executed {
                    fill_price,
                    quantity,
                } => {
                    return self.settle(position, reason, fill_price, quantity).await;
                }
                AttemptOutcome::Failed(detail) => {
                    warn!(
                        market = %market,
                        attempt = position.close_attempts,
                        detail = %detail,
                        "Exit attempt failed"
                    );
                    position
                        .revert_to_open()
                        .map_err(anyhow::Error::msg)?;
                    self.persist(position).await;
                    self.retry_delay().await;
                }
                AttemptOutcome::Unknown(detail) => {
                    // Stay in CLOSING and keep verifying; reverting here
                    // could double-sell.
                    warn!(market = %market, detail = %detail, "Exit outcome unknown, re-verifying");
                    match self.resolve_unknown(position, sell_qty, current_price).await {
                        AttemptOutcome::Executed {
                            fill_price,
                            quantity,
                        } => {
                            return self.settle(position, reason, fill_price, quantity).await;
                        }
                        AttemptOutcome::Failed(detail) => {
                            warn!(market = %market, detail = %detail, "Verified as not executed");
                            position
                                .revert_to_open()
                                .map_err(anyhow::Error::msg)?;
                            self.persist(position).await;
                            self.retry_delay().await;
                        }
                        AttemptOutcome::Unknown(_) => {
                            return Ok(self
                                .abandon(position, "exit outcome unverifiable")
                                .await);
                        }
                    }
                }
            }
        }
    }

    fn exit_trigger(
        &self,
        position: &Position,
        price: Decimal,
        strategy_exit: Option<&str>,
    ) -> Option<ExitReason> {
        if price <= position.stop_loss_price {
            return Some(ExitReason::StopLoss);
        }
        if price >= position.take_profit_price {
            return Some(ExitReason::TakeProfit);
        }
        if let Some(peak) = position.trailing_peak {
            let floor =
                peak * (Decimal::ONE_HUNDRED - self.config.trailing_offset_pct)
                    / Decimal::ONE_HUNDRED;
            if price <= floor {
                return Some(ExitReason::TrailingStop);
            }
        }
        if strategy_exit.is_some() {
            return Some(ExitReason::StrategyExit);
        }
        if position.holding_hours(Utc::now()) >= self.config.max_holding_hours {
            return Some(ExitReason::MaxHoldingTime);
        }
        None
    }

    async fn attempt_exit(
        &self,
        position: &Position,
        sell_qty: Decimal,
        current_price: Decimal,
    ) -> AttemptOutcome {
        let request = OrderRequest::market_sell(&position.market, sell_qty);
        let timeout = std::time::Duration::from_secs(self.config.order_timeout_secs);

        match tokio::time::timeout(timeout, self.exchange.submit_order(&request)).await {
            Ok(Ok(submitted)) => {
                debug!(
                    market = %position.market,
                    order_id = %submitted.order_id,
                    "Exit order submitted"
                );
                self.verify_order(&submitted.order_id, position, sell_qty, current_price)
                    .await
            }
            Ok(Err(e)) => AttemptOutcome::Failed(format!("submission rejected: {e}")),
            Err(_) => {
                // No acknowledgement at all; the order may still have landed.
                AttemptOutcome::Unknown("submission timed out".to_string())
            }
        }
    }

    async fn verify_order(
        &self,
        order_id: &str,
        position: &Position,
        sell_qty: Decimal,
        current_price: Decimal,
    ) -> AttemptOutcome {
        match self.exchange.get_order(order_id).await {
            Ok(detail) => {
                if detail.status.is_definitely_unexecuted() {
                    AttemptOutcome::Failed(format!("order {:?}", detail.status))
                } else {
                    AttemptOutcome::Executed {
                        fill_price: detail.avg_fill_price.unwrap_or(current_price),
                        quantity: if detail.executed_quantity > Decimal::ZERO {
                            detail.executed_quantity
                        } else {
                            sell_qty
                        },
                    }
                }
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Order status query failed");
                self.verify_by_balance(position, sell_qty, current_price).await
            }
        }
    }

    /// Last-resort verification: a sale must have reduced the base-asset
    /// balance below the quantity we tried to sell.
    async fn verify_by_balance(
        &self,
        position: &Position,
        sell_qty: Decimal,
        current_price: Decimal,
    ) -> AttemptOutcome {
        match self.exchange.get_balance(position.base_asset()).await {
            Ok(balance) if balance < sell_qty => AttemptOutcome::Executed {
                fill_price: current_price,
                quantity: sell_qty,
            },
            Ok(_) => AttemptOutcome::Failed("balance unchanged, order not executed".to_string()),
            Err(e) => AttemptOutcome::Unknown(format!("balance query failed: {e}")),
        }
    }

    async fn resolve_unknown(
        &self,
        position: &Position,
        sell_qty: Decimal,
        current_price: Decimal,
    ) -> AttemptOutcome {
        let mut last = AttemptOutcome::Unknown("unresolved".to_string());
        for _ in 0..self.config.max_close_attempts {
            self.retry_delay().await;
            last = self.verify_by_balance(position, sell_qty, current_price).await;
            if !matches!(last, AttemptOutcome::Unknown(_)) {
                break;
            }
        }
        last
    }

    async fn settle(
        &self,
        position: &mut Position,
        reason: ExitReason,
        fill_price: Decimal,
        quantity: Decimal,
    ) -> Result<TickAction> {
        position.mark_closed().map_err(anyhow::Error::msg)?;
        self.persist(position).await;

        let record = TradeRecord {
            id: position.id,
            market: position.market.clone(),
            strategy: position.strategy.clone(),
            entry_price: position.entry_price,
            exit_price: fill_price,
            quantity,
            pnl: (fill_price - position.entry_price) * quantity,
            pnl_pct: position.pnl_pct(fill_price),
            entered_at: position.entry_timestamp,
            exited_at: Utc::now(),
            exit_reason: reason.to_string(),
        };
        info!(
            market = %record.market,
            reason = %reason,
            pnl = %record.pnl,
            pnl_pct = %record.pnl_pct,
            "Position closed"
        );

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.append(&record).await {
                error!(market = %record.market, error = %e, "Failed to append trade record");
            }
        }
        Ok(TickAction::Closed { reason, record })
    }

    async fn abandon(&self, position: &mut Position, detail: &str) -> TickAction {
        // Already non-terminal here by construction.
        if let Err(e) = position.mark_abandoned() {
            error!(market = %position.market, error = %e, "Abandon transition rejected");
        }
        self.persist(position).await;

        error!(
            market = %position.market,
            quantity = %position.quantity,
            attempts = position.close_attempts,
            detail = %detail,
            "Position ABANDONED, operator intervention required"
        );
        self.alerts.alert(
            AlertKind::PositionAbandoned,
            &format!("Position abandoned on {}", position.market),
            detail,
        );
        TickAction::Abandoned {
            detail: detail.to_string(),
        }
    }

    async fn retry_delay(&self) {
        if self.config.close_retry_delay_secs > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.close_retry_delay_secs,
            ))
            .await;
        }
    }

    async fn persist(&self, position: &Position) {
        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(position) {
            Ok(raw) => {
                if let Err(e) = store.put(&position_key(&position.market), &raw).await {
                    error!(market = %position.market, error = %e, "Failed to persist position");
                }
            }
            Err(e) => error!(market = %position.market, error = %e, "Failed to serialize position"),
        }
    }
}

fn position_key(market: &str) -> String {
    format!("position:{market}")
}
