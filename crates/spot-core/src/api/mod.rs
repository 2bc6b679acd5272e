//! Exchange client interface.
//!
//! The trading core only ever talks to the exchange through this trait, so
//! tests can substitute scripted implementations.

pub mod rest;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Balance, OrderBook, OrderDetail, OrderRequest, SubmittedOrder};
use crate::Result;

pub use rest::RestExchangeClient;

/// Spot exchange REST operations consumed by the trading core.
///
/// All amounts are exact decimals. The account balance reported here is the
/// source of truth for reconciliation; the core never derives it from its
/// own bookkeeping.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_order_book(&self, market: &str) -> Result<OrderBook>;

    async fn get_balances(&self) -> Result<Vec<Balance>>;

    /// Available balance for a single asset; zero when the asset is absent.
    async fn get_balance(&self, asset: &str) -> Result<Decimal> {
        let balances = self.get_balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<SubmittedOrder>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn get_order(&self, order_id: &str) -> Result<OrderDetail>;

    /// Minimum order notional in quote currency. 5,000 KRW on the reference
    /// exchange.
    fn min_order_amount(&self) -> Decimal {
        Decimal::new(5_000, 0)
    }

    /// Decimal places supported for base-asset quantities.
    fn quantity_precision(&self, _market: &str) -> u32 {
        8
    }
}
