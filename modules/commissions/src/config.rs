use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Persistence backend selected by `STORE_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    InMemory,
}

/// Payout transfer backend selected by `PAYOUT_PROVIDER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutProviderKind {
    Mock,
    Http,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub coingate_webhook_secret: String,
    pub stripe_webhook_secret: String,
    pub yookassa_webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub minimum_payout: Decimal,
    /// Currency of operator and partner payout calls that name none
    pub default_currency: String,
    pub payout_provider_timeout_secs: u64,
    pub bulk_payout_concurrency: usize,
    pub payout_provider: PayoutProviderKind,
    pub payout_api_url: Option<String>,
    pub payout_api_key: Option<String>,
    /// 0 disables the periodic sweep
    pub reconcile_interval_secs: u64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = var_or(name, default);
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_type = match var_or("STORE_TYPE", "postgres").to_lowercase().as_str() {
            "postgres" => StoreType::Postgres,
            "inmemory" => StoreType::InMemory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "STORE_TYPE",
                    value: other.to_string(),
                })
            }
        };

        let database_url = env::var("DATABASE_URL").ok();
        if store_type == StoreType::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let payout_provider = match var_or("PAYOUT_PROVIDER", "mock").to_lowercase().as_str() {
            "mock" => PayoutProviderKind::Mock,
            "http" => PayoutProviderKind::Http,
            other => {
                return Err(ConfigError::Invalid {
                    name: "PAYOUT_PROVIDER",
                    value: other.to_string(),
                })
            }
        };

        let payout_api_url = env::var("PAYOUT_API_URL").ok();
        let payout_api_key = env::var("PAYOUT_API_KEY").ok();
        if payout_provider == PayoutProviderKind::Http {
            if payout_api_url.is_none() {
                return Err(ConfigError::Missing("PAYOUT_API_URL"));
            }
            if payout_api_key.is_none() {
                return Err(ConfigError::Missing("PAYOUT_API_KEY"));
            }
        }

        let bulk_payout_concurrency: usize = parse_var("BULK_PAYOUT_CONCURRENCY", "4")?;
        if bulk_payout_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "BULK_PAYOUT_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        let raw_currency = var_or("DEFAULT_CURRENCY", "USD");
        let default_currency =
            crate::money::normalize_currency(&raw_currency).ok_or_else(|| ConfigError::Invalid {
                name: "DEFAULT_CURRENCY",
                value: raw_currency.clone(),
            })?;

        Ok(Config {
            store_type,
            database_url,
            host: var_or("HOST", "0.0.0.0"),
            port: parse_var("PORT", "8094")?,
            coingate_webhook_secret: var_or("COINGATE_WEBHOOK_SECRET", ""),
            stripe_webhook_secret: var_or("STRIPE_WEBHOOK_SECRET", ""),
            yookassa_webhook_secret: var_or("YOOKASSA_WEBHOOK_SECRET", ""),
            webhook_tolerance_secs: parse_var("WEBHOOK_TOLERANCE_SECS", "300")?,
            minimum_payout: parse_var("MINIMUM_PAYOUT", "50")?,
            default_currency,
            payout_provider_timeout_secs: parse_var("PAYOUT_PROVIDER_TIMEOUT_SECS", "30")?,
            bulk_payout_concurrency,
            payout_provider,
            payout_api_url,
            payout_api_key,
            reconcile_interval_secs: parse_var("RECONCILE_INTERVAL_SECS", "300")?,
        })
    }
}
