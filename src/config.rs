//! Runtime configuration parsed from environment variables.

use std::time::Duration;

use crate::protocol::{REQUEST_CHANNEL, RESPONSE_CHANNEL};

pub const DEFAULT_ASSET_BASE_URL: &str = "http://localhost:5173";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConfig {
    /// Base URL condition images are served from.
    pub asset_base_url: String,
    /// How long a client waits for a response.
    pub request_timeout_ms: u64,
    pub request_channel: String,
    pub response_channel: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            asset_base_url: DEFAULT_ASSET_BASE_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_channel: REQUEST_CHANNEL.to_string(),
            response_channel: RESPONSE_CHANNEL.to_string(),
        }
    }
}

impl MarkerConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// - `CONDITION_MARKERS_ASSET_BASE_URL`: default `http://localhost:5173`
    /// - `CONDITION_MARKERS_TIMEOUT_MS`: default 5000
    /// - `CONDITION_MARKERS_REQUEST_CHANNEL`: default `conditionmarkers.api.request`
    /// - `CONDITION_MARKERS_RESPONSE_CHANNEL`: default `conditionmarkers.api.response`
    #[must_use]
    pub fn from_env() -> Self {
        let asset_base_url = env_string("CONDITION_MARKERS_ASSET_BASE_URL", DEFAULT_ASSET_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            asset_base_url,
            request_timeout_ms: env_parse("CONDITION_MARKERS_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            request_channel: env_string("CONDITION_MARKERS_REQUEST_CHANNEL", REQUEST_CHANNEL),
            response_channel: env_string("CONDITION_MARKERS_RESPONSE_CHANNEL", RESPONSE_CHANNEL),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => default.to_string(),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
