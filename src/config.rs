use std::env;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::models::DEFAULT_MAX_BODY_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Send-path bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLimits {
    pub max_body_len: usize,
    /// Messages a sender may write inside one `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub retention: Duration,
}

impl Default for ChatLimits {
    fn default() -> Self {
        ChatLimits {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            rate_limit: 60,
            rate_window: Duration::from_secs(60),
            retention: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

impl ChatLimits {
    /// Start of the rate window that ends at `now`. A window reaching past
    /// the representable range has no lower bound.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        before(now, self.rate_window)
    }

    /// Messages older than this are expired.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        before(now, self.retention)
    }
}

fn before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Longest window or retention horizon the config accepts.
const MAX_SPAN_SECS: u64 = 100 * 365 * DAY_SECS;
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo { uri: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub database_name: String,
    pub jwt_secret: String,
    pub frontend_origin: String,
    pub limits: ChatLimits,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store = match var("CHAT_STORE").as_deref().unwrap_or("mongo") {
            "mongo" => StoreBackend::Mongo {
                uri: var("MONGO_URI").ok_or(ConfigError::Missing("MONGO_URI"))?,
            },
            "memory" => StoreBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "CHAT_STORE",
                    value: other.to_string(),
                })
            }
        };
        let defaults = ChatLimits::default();

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            store,
            database_name: var("DATABASE_NAME").unwrap_or_else(|| "chat_db".to_string()),
            jwt_secret: var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            frontend_origin: var("FRONTEND_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            limits: ChatLimits {
                max_body_len: parsed(&var, "CHAT_MAX_MESSAGE_LEN", defaults.max_body_len)?,
                rate_limit: parsed(&var, "CHAT_RATE_LIMIT", defaults.rate_limit)?,
                rate_window: span(
                    "CHAT_RATE_WINDOW_SECS",
                    parsed(&var, "CHAT_RATE_WINDOW_SECS", defaults.rate_window.as_secs())?,
                    1,
                )?,
                retention: span(
                    "CHAT_RETENTION_DAYS",
                    parsed(&var, "CHAT_RETENTION_DAYS", defaults.retention.as_secs() / DAY_SECS)?,
                    DAY_SECS,
                )?,
            },
        })
    }
}

fn parsed<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn span(name: &'static str, amount: u64, unit_secs: u64) -> Result<Duration, ConfigError> {
    amount
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_SPAN_SECS)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::Invalid {
            name,
            value: amount.to_string(),
        })
}
