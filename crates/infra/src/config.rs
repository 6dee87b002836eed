//! Process configuration, read once from the environment at startup and
//! passed down through constructors.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub use supplyline_observability::{LogConfig, LogFormat};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse `{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockServiceConfig {
    pub bind_addr: SocketAddr,
    /// In-memory stores when unset.
    pub database_url: Option<String>,
    pub row_lock_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchServiceConfig {
    pub bind_addr: SocketAddr,
    /// In-memory stores when unset.
    pub database_url: Option<String>,
    pub stock_service_url: String,
    pub lock_call_timeout: Duration,
    pub reconcile_interval: Duration,
    /// Age after which an in-flight allocation attempt is presumed abandoned.
    pub orphan_ttl: Duration,
    pub outbox_poll_interval: Duration,
    /// Log-only notifier when unset.
    pub logistics_url: Option<String>,
    pub row_lock_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub log: LogConfig,
    pub stock: StockServiceConfig,
    pub dispatch: DispatchServiceConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let log = LogConfig {
            filter: get("SUPPLYLINE_LOG").unwrap_or_else(|| "info".to_string()),
            format: match get("SUPPLYLINE_LOG_FORMAT") {
                Some(value) => value.parse().map_err(|e: supplyline_observability::UnknownLogFormat| {
                    ConfigError::Invalid {
                        var: "SUPPLYLINE_LOG_FORMAT",
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?,
                None => LogFormat::default(),
            },
        };

        let row_lock_timeout = millis(&get, "STOCK_ROW_LOCK_TIMEOUT_MS", 5_000)?;
        let stock = StockServiceConfig {
            bind_addr: addr(&get, "STOCK_BIND_ADDR", "0.0.0.0:8081")?,
            database_url: get("STOCK_DATABASE_URL"),
            row_lock_timeout,
        };

        let dispatch = DispatchServiceConfig {
            bind_addr: addr(&get, "DISPATCH_BIND_ADDR", "0.0.0.0:8082")?,
            database_url: get("DISPATCH_DATABASE_URL"),
            stock_service_url: get("STOCK_SERVICE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8081".to_string()),
            lock_call_timeout: millis(&get, "LOCK_CALL_TIMEOUT_MS", 5_000)?,
            reconcile_interval: secs(&get, "RECONCILE_INTERVAL_SECS", 30)?,
            orphan_ttl: secs(&get, "ORPHAN_TTL_SECS", 300)?,
            outbox_poll_interval: millis(&get, "OUTBOX_POLL_INTERVAL_MS", 1_000)?,
            logistics_url: get("LOGISTICS_URL"),
            row_lock_timeout,
        };

        if dispatch.orphan_ttl <= dispatch.lock_call_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "ORPHAN_TTL_SECS ({:?}) must exceed LOCK_CALL_TIMEOUT_MS ({:?})",
                dispatch.orphan_ttl, dispatch.lock_call_timeout
            )));
        }

        Ok(Self {
            log,
            stock,
            dispatch,
        })
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        })
}

fn addr<G>(get: &G, var: &'static str, default: &str) -> Result<SocketAddr, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<SocketAddr, G>(get, var)? {
        Some(addr) => Ok(addr),
        None => default.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            var,
            value: default.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn millis<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_millis(
        parse::<u64, G>(get, var)?.unwrap_or(default),
    ))
}

fn secs<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parse::<u64, G>(get, var)?.unwrap_or(default)))
}
