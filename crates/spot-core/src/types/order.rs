//! Order types for exchange interaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Fixed price; requires `price` on the request.
    Limit,
    /// Taker order against the current book.
    Market,
}

/// An order to be submitted to the exchange.
///
/// For market buys `amount` is quote currency to spend; for sells it is the
/// base-asset quantity to sell. This mirrors the exchange's own convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side id, for correlating reports and logs.
    pub client_id: Uuid,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market_buy(market: impl Into<String>, quote_amount: Decimal) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            market: market.into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount: quote_amount,
            price: None,
        }
    }

    pub fn market_sell(market: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            market: market.into(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            amount: quantity,
            price: None,
        }
    }

    pub fn limit(
        market: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            market: market.into(),
            side,
            order_type: OrderType::Limit,
            amount: quantity,
            price: Some(price),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, waiting in the book.
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    /// Exchange returned a status we do not recognize.
    Unknown,
}

impl OrderStatus {
    /// Terminal statuses that definitively did not (fully) execute.
    pub fn is_definitely_unexecuted(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Acknowledgement returned by the exchange at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedOrder {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Full order state as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Base quantity executed so far.
    pub executed_quantity: Decimal,
    /// Average fill price, when anything has executed.
    pub avg_fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}
