//! Runtime Configuration

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffConfig, RetryPolicy};

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub viewport: ViewportConfig,
    pub resources: ResourcesConfig,
    pub visibility: VisibilityConfig,
    pub poller: PollerConfig,
}

impl Config {
    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let resources = &self.resources;
        if resources.min_pass_delay_ms > resources.max_pass_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "minPassDelayMs ({}) exceeds maxPassDelayMs ({})",
                resources.min_pass_delay_ms, resources.max_pass_delay_ms
            )));
        }
        if resources.load_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("loadRetry.maxAttempts must be at least 1".into()));
        }
        if !(20..=100).contains(&self.visibility.initial_delay_ms) {
            return Err(ConfigError::Invalid(format!(
                "visibility.initialDelayMs must be within 20..=100, got {}",
                self.visibility.initial_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.poller.jitter) {
            return Err(ConfigError::Invalid(format!(
                "poller.jitter must be within 0..=1, got {}",
                self.poller.jitter
            )));
        }
        Ok(())
    }
}

/// Scroll tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewportConfig {
    /// Quiet period after the last raw scroll event before measuring velocity.
    pub scroll_debounce_ms: u64,

    /// Re-check interval while the page is still moving.
    pub settle_check_ms: u64,

    /// Below this speed (px/ms) the scroll position counts as settled.
    pub min_velocity: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            scroll_debounce_ms: 500,
            settle_check_ms: 250,
            // 20px/s
            min_velocity: 0.02,
        }
    }
}

/// Resource scheduling windows and pass timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourcesConfig {
    /// Load window reach above and below the viewport, in viewport heights.
    pub load_margin: f64,

    /// Extra reach in the scroll direction, in viewport heights.
    pub scroll_extension: f64,

    /// Active window reach above and below the viewport, as a fraction of
    /// its height.
    pub active_margin: f64,

    /// Idle loading kicks in once nothing has started loading for this long.
    pub idle_timeout_ms: u64,

    /// Most resources an idle scan may start.
    pub idle_batch: usize,

    pub min_pass_delay_ms: u64,
    pub max_pass_delay_ms: u64,

    /// Delay of the follow-up pass after a load settles.
    pub post_load_pass_delay_ms: u64,

    pub load_retry: RetryPolicy,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            load_margin: 1.0,
            scroll_extension: 1.0,
            active_margin: 0.25,
            idle_timeout_ms: 3000,
            idle_batch: 4,
            min_pass_delay_ms: 5000,
            max_pass_delay_ms: 30000,
            post_load_pass_delay_ms: 1000,
            load_retry: RetryPolicy::default(),
        }
    }
}

/// Visibility listener timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VisibilityConfig {
    /// Delay before a new listener is first evaluated, letting layout settle.
    pub initial_delay_ms: u64,

    /// Visibility seen within this long of registration is reported as
    /// load-time visibility.
    pub load_time_window_ms: u64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            load_time_window_ms: 300,
        }
    }
}

/// Poller interval jitter and failure backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollerConfig {
    /// Jitter fraction applied to the base interval.
    pub jitter: f64,

    pub backoff: BackoffConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            jitter: 0.2,
            backoff: BackoffConfig::default(),
        }
    }
}
