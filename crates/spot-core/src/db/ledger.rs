//! Append-only trade ledger.
//!
//! Win-rate and payoff-ratio statistics for position sizing, and trailing
//! loss counts for the circuit breakers, are all derived from this ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::TradeRecord;
use crate::Result;

/// Append-only record of closed trades, queryable by market, strategy, and
/// time window.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    async fn append(&self, record: &TradeRecord) -> Result<()>;

    /// Most recent trades, newest first, optionally filtered by market
    /// and/or strategy.
    async fn recent(
        &self,
        market: Option<&str>,
        strategy: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TradeRecord>>;

    /// Number of losing trades for a market since `since`.
    async fn losses_since(&self, market: &str, since: DateTime<Utc>) -> Result<u32>;
}

/// Postgres-backed ledger used in production.
pub struct PgTradeLedger {
    pool: PgPool,
}

impl PgTradeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> TradeRecord {
        TradeRecord {
            id: row.get("id"),
            market: row.get("market"),
            strategy: row.get("strategy"),
            entry_price: row.get("entry_price"),
            exit_price: row.get("exit_price"),
            quantity: row.get("quantity"),
            pnl: row.get("pnl"),
            pnl_pct: row.get("pnl_pct"),
            entered_at: row.get("entered_at"),
            exited_at: row.get("exited_at"),
            exit_reason: row.get("exit_reason"),
        }
    }
}

#[async_trait]
impl TradeLedger for PgTradeLedger {
    async fn append(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_ledger (
                id, market, strategy, entry_price, exit_price, quantity,
                pnl, pnl_pct, entered_at, exited_at, exit_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.market)
        .bind(&record.strategy)
        .bind(record.entry_price)
        .bind(record.exit_price)
        .bind(record.quantity)
        .bind(record.pnl)
        .bind(record.pnl_pct)
        .bind(record.entered_at)
        .bind(record.exited_at)
        .bind(&record.exit_reason)
        .execute(&self.pool)
        .await?;

        debug!(market = %record.market, pnl = %record.pnl, "Appended trade record");
        Ok(())
    }

    async fn recent(
        &self,
        market: Option<&str>,
        strategy: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, market, strategy, entry_price, exit_price, quantity,
                   pnl, pnl_pct, entered_at, exited_at, exit_reason
            FROM trade_ledger
            WHERE ($1::text IS NULL OR market = $1)
              AND ($2::text IS NULL OR strategy = $2)
            ORDER BY exited_at DESC
            LIMIT $3
            "#,
        )
        .bind(market)
        .bind(strategy)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn losses_since(&self, market: &str, since: DateTime<Utc>) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trade_ledger WHERE market = $1 AND exited_at >= $2 AND pnl < 0",
        )
        .bind(market)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("n") as u32)
    }
}

/// In-memory ledger for tests and paper runs.
#[derive(Default)]
pub struct MemoryTradeLedger {
    records: RwLock<Vec<TradeRecord>>,
}

impl MemoryTradeLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeLedger for MemoryTradeLedger {
    async fn append(&self, record: &TradeRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(
        &self,
        market: Option<&str>,
        strategy: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TradeRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<TradeRecord> = records
            .iter()
            .filter(|r| market.map(|m| r.market == m).unwrap_or(true))
            .filter(|r| strategy.map(|s| r.strategy == s).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.exited_at.cmp(&a.exited_at));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    async fn losses_since(&self, market: &str, since: DateTime<Utc>) -> Result<u32> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.market == market && r.exited_at >= since && r.is_loss())
            .count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn record(market: &str, strategy: &str, pnl: i64, hours_ago: i64) -> TradeRecord {
        let exited = Utc::now() - Duration::hours(hours_ago);
        TradeRecord {
            id: Uuid::new_v4(),
            market: market.to_string(),
            strategy: strategy.to_string(),
            entry_price: Decimal::new(100, 0),
            exit_price: Decimal::new(100 + pnl, 0),
            quantity: Decimal::ONE,
            pnl: Decimal::new(pnl, 0),
            pnl_pct: Decimal::new(pnl, 0),
            entered_at: exited - Duration::hours(1),
            exited_at: exited,
            exit_reason: "take_profit".to_string(),
        }
    }

    #[tokio::test]
    async fn test_recent_filters_and_orders() {
        let ledger = MemoryTradeLedger::new();
        ledger.append(&record("KRW-BTC", "trend", 5, 3)).await.unwrap();
        ledger.append(&record("KRW-BTC", "dca", -2, 2)).await.unwrap();
        ledger.append(&record("KRW-ETH", "trend", 1, 1)).await.unwrap();

        let btc = ledger.recent(Some("KRW-BTC"), None, 10).await.unwrap();
        assert_eq!(btc.len(), 2);
        // Newest first.
        assert_eq!(btc[0].strategy, "dca");

        let trend = ledger.recent(None, Some("trend"), 10).await.unwrap();
        assert_eq!(trend.len(), 2);
    }

    #[tokio::test]
    async fn test_losses_since_window() {
        let ledger = MemoryTradeLedger::new();
        ledger.append(&record("KRW-BTC", "trend", -1, 30)).await.unwrap(); // outside 24h
        ledger.append(&record("KRW-BTC", "trend", -1, 2)).await.unwrap();
        ledger.append(&record("KRW-BTC", "trend", 3, 1)).await.unwrap();

        let losses = ledger
            .losses_since("KRW-BTC", Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(losses, 1);
    }
}
