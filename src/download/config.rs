//! Engine configuration.
//!
//! [`EngineConfig`] carries every tunable the writer and item use. The
//! defaults reproduce the engine's documented constants; the CLI maps its
//! flags onto a config and calls [`EngineConfig::validate`] before use.

use std::path::PathBuf;
use std::time::Duration;

use super::constants::{
    DEFAULT_STREAM_CAPACITY, MAX_AUTO_RESUME_ATTEMPTS, MAX_DRAIN_BLOCKING_TIME,
    PROGRESS_UPDATE_INTERVAL,
};
use super::error::ConfigError;
use super::retry::RetryPolicy;
use super::writer::WriterConfig;

/// What to do when a resumed response reports different validators or
/// content-disposition than the partial data was downloaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginChangePolicy {
    /// Record the change in the event log and keep going.
    #[default]
    LogOnly,
    /// Treat the partial data as stale and restart from zero.
    Restart,
}

/// Tunables for destination writers and download items.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How often a writer reports progress.
    pub progress_interval: Duration,
    /// Wall-clock budget of one drain pass.
    pub max_drain_blocking: Duration,
    /// Retry policy for renames hitting transient file errors.
    pub rename_retry: RetryPolicy,
    /// Spacing between automatic resumptions.
    pub auto_resume_backoff: RetryPolicy,
    /// Automatic resumptions allowed before user action is required.
    pub max_auto_resume_attempts: u32,
    /// Require the user to acknowledge a corrupt partial file before restarting.
    pub hold_on_local_corruption: bool,
    /// Reaction to validators changing across a resumption.
    pub origin_change_policy: OriginChangePolicy,
    /// Chunks the network pump may queue ahead of the writer.
    pub stream_capacity: usize,
    /// Directory for temporary files when no path is known yet.
    pub default_download_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress_interval: PROGRESS_UPDATE_INTERVAL,
            max_drain_blocking: MAX_DRAIN_BLOCKING_TIME,
            rename_retry: RetryPolicy::rename_default(),
            auto_resume_backoff: RetryPolicy::auto_resume_default(),
            max_auto_resume_attempts: MAX_AUTO_RESUME_ATTEMPTS,
            hold_on_local_corruption: true,
            origin_change_policy: OriginChangePolicy::LogOnly,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            default_download_dir: None,
        }
    }
}

impl EngineConfig {
    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.progress_interval.is_zero() {
            return Err(ConfigError::invalid(
                "progress_interval",
                "must be greater than zero",
            ));
        }
        if self.max_drain_blocking.is_zero() {
            return Err(ConfigError::invalid(
                "max_drain_blocking",
                "must be greater than zero",
            ));
        }
        if self.stream_capacity == 0 {
            return Err(ConfigError::invalid(
                "stream_capacity",
                "must hold at least one chunk",
            ));
        }
        if self.rename_retry.backoff_multiplier() < 1.0 {
            return Err(ConfigError::invalid(
                "rename_retry",
                format!(
                    "backoff multiplier {} must be at least 1.0",
                    self.rename_retry.backoff_multiplier()
                ),
            ));
        }
        if self.auto_resume_backoff.backoff_multiplier() < 1.0 {
            return Err(ConfigError::invalid(
                "auto_resume_backoff",
                format!(
                    "backoff multiplier {} must be at least 1.0",
                    self.auto_resume_backoff.backoff_multiplier()
                ),
            ));
        }
        if let Some(dir) = &self.default_download_dir
            && dir.as_os_str().is_empty()
        {
            return Err(ConfigError::invalid(
                "default_download_dir",
                "must not be an empty path",
            ));
        }
        Ok(())
    }

    /// The subset of settings a destination writer needs.
    #[must_use]
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            progress_interval: self.progress_interval,
            max_drain_blocking: self.max_drain_blocking,
            rename_retry: self.rename_retry.clone(),
        }
    }
}
