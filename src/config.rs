//! Configuration for sidecall clients.
//!
//! Provides serde-backed option structs that load from TOML files or
//! environment variables and convert into the validated [`RetrySettings`]
//! and [`BundlingSettings`] the decorators consume. Durations are expressed
//! in milliseconds in configuration sources.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bundling::BundlingSettings;
use crate::error::Result;
use crate::retry::RetrySettings;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub retry: RetryOptions,
    pub bundling: BundlingOptions,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `SIDECALL_*` environment variables, starting
    /// from the defaults.
    pub fn from_env() -> Self {
        let mut config = ClientConfig::default();

        if let Ok(total) = std::env::var("SIDECALL_TOTAL_TIMEOUT_MS") {
            if let Ok(ms) = total.parse::<u64>() {
                config.retry.total_timeout_ms = ms;
            }
        }

        if let Ok(delay) = std::env::var("SIDECALL_INITIAL_RETRY_DELAY_MS") {
            if let Ok(ms) = delay.parse::<u64>() {
                config.retry.initial_retry_delay_ms = ms;
            }
        }

        if let Ok(enabled) = std::env::var("SIDECALL_BUNDLING_ENABLED") {
            config.bundling.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }

        if let Ok(threshold) = std::env::var("SIDECALL_BUNDLE_ELEMENT_COUNT") {
            if let Ok(count) = threshold.parse::<usize>() {
                config.bundling.element_count_threshold = count;
            }
        }

        config
    }
}

/// Retry schedule options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub initial_retry_delay_ms: u64,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub initial_rpc_timeout_ms: u64,
    pub rpc_timeout_multiplier: f64,
    pub max_rpc_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub jittered: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 100,
            retry_delay_multiplier: 2.0,
            max_retry_delay_ms: 10_000,
            initial_rpc_timeout_ms: 30_000,
            rpc_timeout_multiplier: 1.0,
            max_rpc_timeout_ms: 30_000,
            total_timeout_ms: 600_000,
            jittered: false,
        }
    }
}

impl RetryOptions {
    /// Validate and convert into [`RetrySettings`].
    pub fn to_settings(&self) -> Result<RetrySettings> {
        RetrySettings::builder()
            .initial_retry_delay(Duration::from_millis(self.initial_retry_delay_ms))
            .retry_delay_multiplier(self.retry_delay_multiplier)
            .max_retry_delay(Duration::from_millis(self.max_retry_delay_ms))
            .initial_rpc_timeout(Duration::from_millis(self.initial_rpc_timeout_ms))
            .rpc_timeout_multiplier(self.rpc_timeout_multiplier)
            .max_rpc_timeout(Duration::from_millis(self.max_rpc_timeout_ms))
            .total_timeout(Duration::from_millis(self.total_timeout_ms))
            .jittered(self.jittered)
            .build()
    }
}

/// Bundling threshold options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlingOptions {
    pub enabled: bool,
    pub element_count_threshold: usize,
    pub request_byte_threshold: usize,
    pub delay_threshold_ms: u64,
    pub blocking_call_count_threshold: usize,
}

impl Default for BundlingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            element_count_threshold: 1,
            request_byte_threshold: 0,
            delay_threshold_ms: 10,
            blocking_call_count_threshold: 0,
        }
    }
}

impl BundlingOptions {
    /// Validate and convert into [`BundlingSettings`].
    pub fn to_settings(&self) -> Result<BundlingSettings> {
        BundlingSettings::builder()
            .enabled(self.enabled)
            .element_count_threshold(self.element_count_threshold)
            .request_byte_threshold(self.request_byte_threshold)
            .delay_threshold(Duration::from_millis(self.delay_threshold_ms))
            .blocking_call_count_threshold(self.blocking_call_count_threshold)
            .build()
    }
}
