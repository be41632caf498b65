//! Tunables for retry, queues and the registry.
//!
//! Every struct deserializes from camelCase JSON with all fields optional.

use crate::ftp::error::{FtpError, FtpResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ─── Retry ───────────────────────────────────────────────────────────

/// Bounded exponential backoff for connect and list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = never retry).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let delay = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(FtpError::invalid_config("backoffMultiplier must be >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(FtpError::invalid_config(
                "initialBackoffMs must not exceed maxBackoffMs",
            ));
        }
        Ok(())
    }
}

// ─── Transfer queue ──────────────────────────────────────────────────

/// Per-direction queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferQueueConfig {
    /// Chunk size for streamed reads/writes (bytes).
    #[serde(default = "default_chunk")]
    pub chunk_size: usize,
    /// Minimum spacing between progress events for one job.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    /// Silence on a running job longer than this flags it as stalled.
    #[serde(default = "default_watchdog")]
    pub watchdog_interval_sec: u64,
    /// Finished jobs retained per session.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Buffer of the queue's broadcast event stream.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_chunk() -> usize {
    65_536
}
fn default_progress_interval() -> u64 {
    250
}
fn default_watchdog() -> u64 {
    30
}
fn default_history_limit() -> usize {
    500
}
fn default_event_capacity() -> usize {
    256
}

impl Default for TransferQueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk(),
            progress_interval_ms: default_progress_interval(),
            watchdog_interval_sec: default_watchdog(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl TransferQueueConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_sec)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.chunk_size == 0 {
            return Err(FtpError::invalid_config("chunkSize must be > 0"));
        }
        if self.watchdog_interval_sec == 0 {
            return Err(FtpError::invalid_config("watchdogIntervalSec must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(FtpError::invalid_config("eventCapacity must be > 0"));
        }
        Ok(())
    }
}

// ─── Registry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Sessions with no activity for this long are evicted (0 = never).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    /// Period of the maintenance task.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_sec: u64,
    /// Send NOOP to idle-but-kept sessions on every sweep.
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
}

fn default_idle_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_keepalive() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_sec: default_idle_timeout(),
            sweep_interval_sec: default_sweep_interval(),
            keepalive: default_keepalive(),
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpSessionsConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: TransferQueueConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl FtpSessionsConfig {
    pub fn from_json_str(raw: &str) -> FtpResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> FtpResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            FtpError::invalid_config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> FtpResult<()> {
        self.retry.validate()?;
        self.queue.validate()?;
        if self.registry.sweep_interval_sec == 0 {
            return Err(FtpError::invalid_config("sweepIntervalSec must be > 0"));
        }
        Ok(())
    }
}
