//! Configuration management for the spot trading system.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub exchange: ExchangeConfig,
    pub alerts: AlertsConfig,
    pub trading: TradingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Total capital allocated to the bot, in quote currency (KRW).
    pub capital: Decimal,
    /// Daily realized-loss halt threshold, percent of capital.
    pub daily_loss_limit_pct: Decimal,
    /// UTC offset (hours) of the daily reset boundary. KST = +9.
    pub daily_reset_utc_offset_hours: i32,
    /// Whether orders are actually submitted (false = paper trading).
    pub live_trading: bool,
    /// Markets the engine evaluates, e.g. "KRW-BTC".
    pub markets: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| Error::Config {
                    message: "DATABASE_URL environment variable not set".to_string(),
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            exchange: ExchangeConfig {
                rest_url: env::var("EXCHANGE_REST_URL")
                    .unwrap_or_else(|_| "https://api.upbit.com/v1".to_string()),
                access_key: env::var("EXCHANGE_ACCESS_KEY").ok(),
                secret_key: env::var("EXCHANGE_SECRET_KEY").ok(),
            },
            alerts: AlertsConfig {
                slack_webhook_url: env::var("SLACK_WEBHOOK_URL").ok(),
            },
            trading: TradingConfig {
                capital: parse_decimal_env("TRADING_CAPITAL", Decimal::new(1_000_000, 0))?,
                daily_loss_limit_pct: parse_decimal_env(
                    "DAILY_LOSS_LIMIT_PCT",
                    Decimal::new(5, 0),
                )?,
                daily_reset_utc_offset_hours: env::var("DAILY_RESET_UTC_OFFSET_HOURS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(9),
                live_trading: env::var("LIVE_TRADING")
                    .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
                markets: env::var("TRADING_MARKETS")
                    .unwrap_or_else(|_| "KRW-BTC".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
        })
    }

    /// Validate cross-field constraints before starting the engine.
    pub fn validate(&self) -> Result<()> {
        if self.trading.capital <= Decimal::ZERO {
            return Err(Error::Config {
                message: "TRADING_CAPITAL must be positive".to_string(),
            });
        }
        if self.trading.daily_loss_limit_pct <= Decimal::ZERO {
            return Err(Error::Config {
                message: "DAILY_LOSS_LIMIT_PCT must be positive".to_string(),
            });
        }
        if self.trading.markets.is_empty() {
            return Err(Error::Config {
                message: "TRADING_MARKETS must list at least one market".to_string(),
            });
        }
        if self.trading.live_trading
            && (self.exchange.access_key.is_none() || self.exchange.secret_key.is_none())
        {
            return Err(Error::Config {
                message: "live trading requires EXCHANGE_ACCESS_KEY and EXCHANGE_SECRET_KEY"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Load configuration for testing (with defaults).
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/spotbot_test".to_string(),
                max_connections: 2,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            exchange: ExchangeConfig {
                rest_url: "https://api.upbit.com/v1".to_string(),
                access_key: None,
                secret_key: None,
            },
            alerts: AlertsConfig::default(),
            trading: TradingConfig {
                capital: Decimal::new(1_000_000, 0),
                daily_loss_limit_pct: Decimal::new(5, 0),
                daily_reset_utc_offset_hours: 9,
                live_trading: false,
                markets: vec!["KRW-BTC".to_string()],
            },
        }
    }
}

fn parse_decimal_env(name: &str, default: Decimal) -> Result<Decimal> {
    match env::var(name) {
        Ok(raw) => Decimal::from_str(&raw).map_err(|_| Error::Config {
            message: format!("{} is not a valid decimal: {}", name, raw),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validates() {
        let config = Config::test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_live_trading_requires_keys() {
        let mut config = Config::test_config();
        config.trading.live_trading = true;
        assert!(config.validate().is_err());

        config.exchange.access_key = Some("ak".to_string());
        config.exchange.secret_key = Some("sk".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capital_rejected() {
        let mut config = Config::test_config();
        config.trading.capital = Decimal::ZERO;
        assert!(config.validate().is_err());
    }
}
