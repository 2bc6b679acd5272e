//! Error types for the spot trading system.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Exchange API error: {message}")]
    Exchange { message: String, status: Option<u16> },

    #[error("Order error: {message}")]
    Order { message: String },

    #[error("Invalid market data: {0}")]
    InvalidMarket(String),

    #[error("Position error: {0}")]
    Position(String),
}

pub type Result<T> = std::result::Result<T, Error>;
