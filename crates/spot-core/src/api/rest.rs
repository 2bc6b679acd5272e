//! Minimal REST implementation of [`ExchangeClient`].
//!
//! Endpoint shapes follow the reference exchange (Upbit-style paths and
//! payloads). Request signing is deployment-specific and supplied through
//! default headers on the underlying HTTP client.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::types::{
    Balance, OrderBook, OrderBookLevel, OrderDetail, OrderRequest, OrderSide, OrderStatus,
    OrderType, SubmittedOrder,
};
use crate::{Error, Result};

use super::ExchangeClient;

pub struct RestExchangeClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestExchangeClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.rest_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Exchange {
            message: format!("exchange returned {}: {}", status, body),
            status: Some(status.as_u16()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OrderBookUnit {
    ask_price: Decimal,
    bid_price: Decimal,
    ask_size: Decimal,
    bid_size: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderBookResponse {
    market: String,
    orderbook_units: Vec<OrderBookUnit>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    currency: String,
    balance: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    uuid: String,
    market: String,
    side: String,
    state: String,
    executed_volume: Option<Decimal>,
    avg_price: Option<Decimal>,
}

fn parse_status(state: &str) -> OrderStatus {
    match state {
        "wait" | "watch" => OrderStatus::Pending,
        "trade" => OrderStatus::PartiallyFilled,
        "done" => OrderStatus::Filled,
        "cancel" => OrderStatus::Cancelled,
        "reject" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::Unknown,
    }
}

fn parse_side(side: &str) -> OrderSide {
    if side == "bid" {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn get_order_book(&self, market: &str) -> Result<OrderBook> {
        let response = self
            .http
            .get(self.url("/orderbook"))
            .query(&[("markets", market)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let mut books: Vec<OrderBookResponse> = response.json().await?;
        let book = books.pop().ok_or_else(|| {
            Error::InvalidMarket(format!("no order book returned for {}", market))
        })?;

        Ok(OrderBook {
            market: book.market,
            bids: book
                .orderbook_units
                .iter()
                .map(|u| OrderBookLevel {
                    price: u.bid_price,
                    size: u.bid_size,
                })
                .collect(),
            asks: book
                .orderbook_units
                .iter()
                .map(|u| OrderBookLevel {
                    price: u.ask_price,
                    size: u.ask_size,
                })
                .collect(),
            timestamp: Utc::now(),
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let response = self.http.get(self.url("/accounts")).send().await?;
        let response = Self::check_status(response).await?;
        let accounts: Vec<AccountResponse> = response.json().await?;
        Ok(accounts
            .into_iter()
            .map(|a| Balance {
                asset: a.currency,
                available: a.balance,
                locked: a.locked,
            })
            .collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<SubmittedOrder> {
        let side = match request.side {
            OrderSide::Buy => "bid",
            OrderSide::Sell => "ask",
        };
        // Market buys spend quote currency ("price" order); market sells and
        // limit orders specify base volume.
        let mut body = serde_json::json!({
            "market": request.market,
            "side": side,
            "identifier": request.client_id.to_string(),
        });
        match (request.order_type, request.side) {
            (OrderType::Market, OrderSide::Buy) => {
                body["ord_type"] = "price".into();
                body["price"] = request.amount.to_string().into();
            }
            (OrderType::Market, OrderSide::Sell) => {
                body["ord_type"] = "market".into();
                body["volume"] = request.amount.to_string().into();
            }
            (OrderType::Limit, _) => {
                let price = request.price.ok_or_else(|| Error::Order {
                    message: "limit order requires a price".to_string(),
                })?;
                body["ord_type"] = "limit".into();
                body["volume"] = request.amount.to_string().into();
                body["price"] = price.to_string().into();
            }
        }

        debug!(market = %request.market, side = side, "Submitting order");
        let response = self
            .http
            .post(self.url("/orders"))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let order: OrderResponse = response.json().await?;
        Ok(SubmittedOrder {
            order_id: order.uuid,
            status: parse_status(&order.state),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url("/order"))
            .query(&[("uuid", order_id)])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::Order {
                message: format!("order {} not found", order_id),
            }),
            _ => {
                Self::check_status(response).await?;
                Ok(())
            }
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderDetail> {
        let response = self
            .http
            .get(self.url("/order"))
            .query(&[("uuid", order_id)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let order: OrderResponse = response.json().await?;
        Ok(OrderDetail {
            order_id: order.uuid,
            market: order.market,
            side: parse_side(&order.side),
            status: parse_status(&order.state),
            executed_quantity: order.executed_volume.unwrap_or(Decimal::ZERO),
            avg_fill_price: order.avg_price,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("done"), OrderStatus::Filled);
        assert_eq!(parse_status("cancel"), OrderStatus::Cancelled);
        assert_eq!(parse_status("wait"), OrderStatus::Pending);
        assert_eq!(parse_status("???"), OrderStatus::Unknown);
    }

    #[test]
    fn test_parse_side() {
        assert_eq!(parse_side("bid"), OrderSide::Buy);
        assert_eq!(parse_side("ask"), OrderSide::Sell);
    }
}
