//! Exponential backoff for rename retries and automatic resumption.
//!
//! This module provides the [`RetryPolicy`] type used in two places:
//! - the destination writer retries renames that hit a transient file error
//!   ([`RetryPolicy::rename_default`])
//! - the download item spaces out automatic resumptions
//!   ([`RetryPolicy::auto_resume_default`])
//!
//! # Example
//!
//! ```
//! use resumable_downloader_core::download::{InterruptReason, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::rename_default();
//!
//! match policy.should_retry(InterruptReason::FileTransientError, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tracing::{debug, instrument};

use super::constants::{RENAME_RETRY_INITIAL_DELAY, RENAME_RETRY_MAX_RETRIES};
use super::error::FileError;
use super::interrupt::{ErrorKind, InterruptReason};

/// Default base delay for automatic resumption backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default jitter added to automatic resumption delays (500ms).
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision on whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With [`RetryPolicy::rename_default`], delays are exactly 200ms, 400ms, 800ms.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::auto_resume_default()
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings and no jitter.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: Duration::ZERO,
        }
    }

    /// Rename retry: 200ms initial delay, doubling, 3 retries, no jitter.
    #[must_use]
    pub fn rename_default() -> Self {
        Self::new(
            RENAME_RETRY_MAX_RETRIES + 1,
            RENAME_RETRY_INITIAL_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
    }

    /// Automatic resumption spacing: 1s base, doubling, 32s cap, up to 500ms jitter.
    ///
    /// The attempt budget itself is owned by the item, so `max_attempts` is unbounded here.
    #[must_use]
    pub fn auto_resume_default() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// A policy that retries (up to `max_attempts`) without waiting.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Replaces the jitter bound.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn backoff_multiplier(&self) -> f32 {
        self.backoff_multiplier
    }

    /// Determines whether to retry a failed file operation.
    ///
    /// Only transient file errors are retried; every other reason is surfaced
    /// to the caller on the first failure.
    ///
    /// # Arguments
    ///
    /// * `reason` - Why the attempt failed
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, reason: InterruptReason, attempt: u32) -> RetryDecision {
        if reason.kind() != ErrorKind::TransientFile {
            return RetryDecision::DoNotRetry {
                reason: format!("{reason} is not a transient file error"),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay after `attempt` failures with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay) + jitter`
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 = multiplier^0 = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Generates random jitter between 0 and `max_jitter`.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=self.max_jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Runs `operation` against `target` until it succeeds or the policy gives up.
///
/// Returns the final result together with the number of retries performed,
/// so callers can record a success that needed at least one retry.
pub async fn retry_file_operation<S, T, F>(
    policy: &RetryPolicy,
    target: &mut S,
    mut operation: F,
) -> (Result<T, FileError>, u32)
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, FileError>>,
{
    let mut attempt = 1;
    loop {
        match operation(target).await {
            Ok(value) => return (Ok(value), attempt - 1),
            Err(error) => match policy.should_retry(error.reason(), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    debug!(error = %error, delay_ms = delay.as_millis(), "retrying file operation");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => return (Err(error), attempt - 1),
            },
        }
    }
}
