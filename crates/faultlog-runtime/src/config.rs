//! Pipeline tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Bounded retry for remote calls. `max_retries = 0` means a failing call
/// fails the run immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration for one [crate::PipelineController].
///
/// Loadable from TOML; missing keys take their defaults:
///
/// ```toml
/// window_width = 1000
/// buffer_capacity = 1000
/// drain_interval_ms = 10
///
/// [retry]
/// max_retries = 2
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Width `W` of each id window; a window covers `W + 1` ids.
    pub window_width: i64,
    /// Relay buffer capacity `C`, in records.
    pub buffer_capacity: usize,
    /// Drain loop period.
    pub drain_interval_ms: u64,
    /// Lowest id the scan expects to find rows at. A window at or below it
    /// that comes back empty ends the run. Rows further down are only reached
    /// while windows keep returning rows, so sources with ids below 1 should
    /// lower this.
    pub id_floor: i64,
    /// Drop records whose id was already produced in the same run.
    pub dedupe_by_id: bool,
    /// Name prefix for the producer thread.
    pub worker_thread_name: String,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_width: 1000,
            buffer_capacity: 1000,
            drain_interval_ms: 10,
            id_floor: 1,
            dedupe_by_id: false,
            worker_thread_name: "faultlog-query".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_window_width(mut self, window_width: i64) -> Self {
        self.window_width = window_width;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_id_floor(mut self, id_floor: i64) -> Self {
        self.id_floor = id_floor;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.retry = RetryConfig {
            max_retries,
            backoff_ms: backoff.as_millis().try_into().unwrap_or(u64::MAX),
        };
        self
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.window_width < 0 {
            return Err(PipelineError::Config(format!(
                "window_width must not be negative, got {}",
                self.window_width
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(PipelineError::Config(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.drain_interval_ms == 0 {
            return Err(PipelineError::Config(
                "drain_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
