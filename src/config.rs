//! Environment-driven configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Log output format for the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Postgres URL for mappings and derived metrics; in-memory when unset
    pub database_url: Option<String>,
    /// Member queries executed concurrently per group
    pub query_concurrency: usize,
    /// Per-group deadline, `None` when `QUERY_TIMEOUT_SECS` is 0
    pub query_timeout: Option<Duration>,
    pub optimised_profile_filter: bool,
    pub optimised_event_user_filter: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: None,
            query_concurrency: 2,
            query_timeout: None,
            optimised_profile_filter: false,
            optimised_event_user_filter: false,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr = match lookup("LISTEN_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::InvalidInput(format!("Invalid LISTEN_ADDR: {}", raw)))?,
            None => defaults.listen_addr,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let query_concurrency = match lookup("QUERY_CONCURRENCY") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(AppError::InvalidInput(format!(
                        "Invalid QUERY_CONCURRENCY: {}",
                        raw
                    )))
                }
            },
            None => defaults.query_concurrency,
        };

        let query_timeout = match lookup("QUERY_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| {
                    AppError::InvalidInput(format!("Invalid QUERY_TIMEOUT_SECS: {}", raw))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => defaults.query_timeout,
        };

        let optimised_profile_filter =
            parse_flag("OPTIMISED_PROFILE_FILTER", lookup("OPTIMISED_PROFILE_FILTER"))?;
        let optimised_event_user_filter = parse_flag(
            "OPTIMISED_EVENT_USER_FILTER",
            lookup("OPTIMISED_EVENT_USER_FILTER"),
        )?;

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::InvalidInput(format!(
                    "Invalid LOG_FORMAT: {}",
                    other
                )))
            }
        };

        Ok(Self {
            listen_addr,
            database_url,
            query_concurrency,
            query_timeout,
            optimised_profile_filter,
            optimised_event_user_filter,
            log_format,
        })
    }
}

/// Parse a boolean flag value, as used by env vars and request headers.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<bool> {
    match raw {
        None => Ok(false),
        Some(raw) => parse_bool(&raw)
            .ok_or_else(|| AppError::InvalidInput(format!("Invalid {}: {}", key, raw))),
    }
}
