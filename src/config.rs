//! Sync configuration parsed from environment variables.
//!
//! Endpoint names are deployment configuration; everything else has a
//! default tuned for an interactive trip page.

use std::time::Duration;

use crate::client::ReconnectPolicy;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL in {var}: {value}")]
    InvalidUrl { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// REST base URL, no trailing slash (e.g. `http://host/api`).
    pub api_url: String,
    /// WebSocket endpoint for the realtime channel.
    pub realtime_url: String,
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `TRIPSYNC_API_URL`: default `http://127.0.0.1:5000/api`
    /// - `TRIPSYNC_REALTIME_URL`: default is the API origin with a `ws`/`wss` scheme and `/ws` path
    /// - `TRIPSYNC_POLL_INTERVAL_MS`: default 5000
    /// - `TRIPSYNC_RECONNECT_ATTEMPTS`: default 5
    /// - `TRIPSYNC_RECONNECT_BASE_MS`: default 1000
    /// - `TRIPSYNC_RECONNECT_MAX_MS`: default 10000
    /// - `TRIPSYNC_REQUEST_TIMEOUT_SECS`: default 30
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] but reading from an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let api_url = get("TRIPSYNC_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        if !is_http_url(&api_url) {
            return Err(ConfigError::InvalidUrl { var: "TRIPSYNC_API_URL", value: api_url });
        }

        let realtime_url = match get("TRIPSYNC_REALTIME_URL") {
            Some(url) if is_ws_url(&url) => url,
            Some(url) => return Err(ConfigError::InvalidUrl { var: "TRIPSYNC_REALTIME_URL", value: url }),
            None => derive_realtime_url(&api_url)
                .ok_or_else(|| ConfigError::InvalidUrl { var: "TRIPSYNC_API_URL", value: api_url.clone() })?,
        };

        let parse = |key: &str, default: u64| get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

        let reconnect = ReconnectPolicy {
            max_attempts: get("TRIPSYNC_RECONNECT_ATTEMPTS")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            base_delay: Duration::from_millis(parse("TRIPSYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)),
            max_delay: Duration::from_millis(parse("TRIPSYNC_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)),
            ..ReconnectPolicy::default()
        };

        Ok(Self {
            api_url,
            realtime_url,
            poll_interval: Duration::from_millis(parse("TRIPSYNC_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(1)),
            reconnect,
            request_timeout: Duration::from_secs(parse("TRIPSYNC_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)),
        })
    }
}

fn is_http_url(url: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| url.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}

fn is_ws_url(url: &str) -> bool {
    ["ws://", "wss://"]
        .iter()
        .any(|scheme| url.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}

/// `http://host:5000/api` → `ws://host:5000/ws`.
pub fn derive_realtime_url(api_url: &str) -> Option<String> {
    let (scheme, rest) = if let Some(rest) = api_url.strip_prefix("http://") {
        ("ws", rest)
    } else if let Some(rest) = api_url.strip_prefix("https://") {
        ("wss", rest)
    } else {
        return None;
    };
    let host = rest.split('/').next().filter(|h| !h.is_empty())?;
    Some(format!("{scheme}://{host}/ws"))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
