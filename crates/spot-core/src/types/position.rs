//! Position lifecycle types.
//!
//! A `Position` is one open-to-close long exposure on one market. Status
//! transitions are guarded: callers get an error instead of a silently
//! corrupted lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::regime::MarketRegime;

/// Current lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry filled, being monitored.
    Open,
    /// Exit order in flight.
    Closing,
    /// Fully settled.
    Closed,
    /// Exit retries exhausted or nothing left to sell; operator attention
    /// required.
    Abandoned,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Abandoned)
    }
}

/// A long spot position on one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub market: String,
    pub entry_price: Decimal,
    /// Base-asset quantity recorded at entry. The actual sellable quantity
    /// is reconciled against the live exchange balance before any exit.
    pub quantity: Decimal,
    pub entry_timestamp: DateTime<Utc>,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    /// Highest price seen since the trailing stop armed.
    pub trailing_peak: Option<Decimal>,
    pub status: PositionStatus,
    pub close_attempts: u32,
    pub last_close_attempt: Option<DateTime<Utc>>,
    /// Strategy that produced the entry signal.
    pub strategy: String,
    pub regime_at_entry: MarketRegime,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: String,
        entry_price: Decimal,
        quantity: Decimal,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        strategy: String,
        regime_at_entry: MarketRegime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            market,
            entry_price,
            quantity,
            entry_timestamp: Utc::now(),
            stop_loss_price,
            take_profit_price,
            trailing_peak: None,
            status: PositionStatus::Open,
            close_attempts: 0,
            last_close_attempt: None,
            strategy,
            regime_at_entry,
        }
    }

    /// Base asset code, e.g. "BTC" for "KRW-BTC".
    pub fn base_asset(&self) -> &str {
        self.market
            .split_once('-')
            .map(|(_, base)| base)
            .unwrap_or(self.market.as_str())
    }

    /// Unrealized PnL as a percent of the entry price.
    /// Zero for a degenerate (zero) entry price rather than a division error.
    pub fn pnl_pct(&self, current_price: Decimal) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (current_price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }

    /// Raise the trailing peak if the price made a new high.
    pub fn update_trailing_peak(&mut self, price: Decimal) {
        match self.trailing_peak {
            Some(peak) if price <= peak => {}
            _ => self.trailing_peak = Some(price),
        }
    }

    /// Mark the position as closing (exit order in flight).
    /// Only valid from Open.
    pub fn mark_closing(&mut self) -> std::result::Result<(), String> {
        if self.status != PositionStatus::Open {
            return Err(format!(
                "Cannot transition to Closing from {:?} (expected Open)",
                self.status
            ));
        }
        self.status = PositionStatus::Closing;
        self.close_attempts += 1;
        self.last_close_attempt = Some(Utc::now());
        Ok(())
    }

    /// Revert a failed exit attempt back to Open.
    ///
    /// Only valid from Closing, and only when the exit order definitively
    /// did not execute. Ambiguous outcomes must be re-verified against the
    /// exchange before calling this.
    pub fn revert_to_open(&mut self) -> std::result::Result<(), String> {
        if self.status != PositionStatus::Closing {
            return Err(format!(
                "Cannot revert to Open from {:?} (expected Closing)",
                self.status
            ));
        }
        self.status = PositionStatus::Open;
        Ok(())
    }

    /// Mark the position as fully settled. Only valid from Closing.
    pub fn mark_closed(&mut self) -> std::result::Result<(), String> {
        if self.status != PositionStatus::Closing {
            return Err(format!(
                "Cannot transition to Closed from {:?} (expected Closing)",
                self.status
            ));
        }
        self.status = PositionStatus::Closed;
        Ok(())
    }

    /// Give up on the position. Valid from Open or Closing.
    pub fn mark_abandoned(&mut self) -> std::result::Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "Cannot transition to Abandoned from terminal {:?}",
                self.status
            ));
        }
        self.status = PositionStatus::Abandoned;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Hours this position has been held.
    pub fn holding_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_timestamp).num_hours()
    }
}
