use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::viewport::DEFAULT_OVERSCAN;
use crate::session::policy::{DEFAULT_BACKOFF_MAX, DEFAULT_RECONNECT_DELAY};
use crate::session::{ExponentialBackoff, FixedDelay, ReconnectPolicy};
use crate::transport::websocket::WebSocketConfig;
use crate::transport::websocket::config::DEFAULT_PATH;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8888/ws";
pub const DEFAULT_CATALOG: &str = "emojis.json";

pub const ENDPOINT_ENV: &str = "EMOJIGRID_ENDPOINT";
pub const RECONNECT_ENV: &str = "EMOJIGRID_RECONNECT_MS";
pub const BACKOFF_ENV: &str = "EMOJIGRID_BACKOFF";
pub const BACKOFF_MAX_ENV: &str = "EMOJIGRID_BACKOFF_MAX_MS";
pub const OVERSCAN_ENV: &str = "EMOJIGRID_OVERSCAN";
pub const CATALOG_ENV: &str = "EMOJIGRID_CATALOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// Constant delay between attempts.
    #[default]
    Fixed,
    /// Doubling delay with jitter, capped.
    Exponential,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Client configuration, read from `EMOJIGRID_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: String,
    pub reconnect_delay: Duration,
    pub backoff: BackoffKind,
    pub backoff_max: Duration,
    pub overscan: usize,
    pub catalog_path: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup; unset or blank keys
    /// fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let endpoint = get(ENDPOINT_ENV)
            .map(|raw| {
                WebSocketConfig::new(raw)
                    .with_path(DEFAULT_PATH)
                    .build_url()
            })
            .unwrap_or(defaults.endpoint);
        let reconnect_delay = get(RECONNECT_ENV)
            .map(|raw| parse_millis(RECONNECT_ENV, &raw))
            .transpose()?
            .unwrap_or(defaults.reconnect_delay);
        let backoff = get(BACKOFF_ENV)
            .map(|raw| parse_backoff(&raw))
            .transpose()?
            .unwrap_or(defaults.backoff);
        let backoff_max = get(BACKOFF_MAX_ENV)
            .map(|raw| parse_millis(BACKOFF_MAX_ENV, &raw))
            .transpose()?
            .unwrap_or(defaults.backoff_max);
        let overscan = get(OVERSCAN_ENV)
            .map(|raw| {
                raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
                    var: OVERSCAN_ENV,
                    value: raw,
                    expected: "cell count",
                })
            })
            .transpose()?
            .unwrap_or(defaults.overscan);
        let catalog_path = get(CATALOG_ENV)
            .map(PathBuf::from)
            .unwrap_or(defaults.catalog_path);

        Ok(Self {
            endpoint,
            reconnect_delay,
            backoff,
            backoff_max,
            overscan,
            catalog_path,
        })
    }

    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig::new(self.endpoint.clone())
    }

    pub fn reconnect_policy(&self) -> Box<dyn ReconnectPolicy> {
        match self.backoff {
            BackoffKind::Fixed => Box::new(FixedDelay::new(self.reconnect_delay)),
            BackoffKind::Exponential => Box::new(ExponentialBackoff::new(
                self.reconnect_delay,
                self.backoff_max,
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            backoff: BackoffKind::Fixed,
            backoff_max: DEFAULT_BACKOFF_MAX,
            overscan: DEFAULT_OVERSCAN,
            catalog_path: PathBuf::from(DEFAULT_CATALOG),
        }
    }
}

fn parse_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            expected: "positive number of milliseconds",
        }),
    }
}

fn parse_backoff(raw: &str) -> Result<BackoffKind, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffKind::Fixed),
        "exponential" | "exp" => Ok(BackoffKind::Exponential),
        _ => Err(ConfigError::Invalid {
            var: BACKOFF_ENV,
            value: raw.to_string(),
            expected: "backoff (fixed|exponential)",
        }),
    }
}
