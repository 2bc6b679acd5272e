//! Durable state: key-value scalar state and the append-only trade ledger.
//!
//! Everything the risk core needs to survive a cold restart lives behind
//! these two traits.

pub mod ledger;
pub mod state_store;

pub use ledger::{MemoryTradeLedger, PgTradeLedger, TradeLedger};
pub use state_store::{MemoryStateStore, RedisStateStore, StateStore};
