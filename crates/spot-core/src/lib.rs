//! Spot Trading Core Library
//!
//! Shared types, exchange client, durable-state stores, and alerting for the
//! risk-gated spot trading system.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod types;

pub use error::{Error, Result};
