//! Spot Bot: risk-gated spot trading core.
//!
//! This is the root crate that ties the workspace together for integration
//! tests. For actual functionality, use the individual crates directly:
//!
//! - `spot-core`: Shared types, exchange client, durable-state stores
//! - `trading-engine`: Strategy selection, position lifecycle, evaluation engine
//! - `risk-manager`: Circuit breakers, daily-loss tracking, position sizing

pub use risk_manager as risk;
pub use spot_core as core;
pub use trading_engine as trading;
