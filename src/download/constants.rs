//! Constants for the download module (timeouts, writer pacing, resumption limits).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum number of automatic resumptions before user action is required.
pub const MAX_AUTO_RESUME_ATTEMPTS: u32 = 5;

/// How often a destination writer reports progress while data is flowing.
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Wall-clock budget for one pass of the writer drain loop.
pub const MAX_DRAIN_BLOCKING_TIME: Duration = Duration::from_millis(1000);

/// Initial delay before retrying a rename that hit a transient file error.
pub const RENAME_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Number of retries for a rename after the first failed attempt.
pub const RENAME_RETRY_MAX_RETRIES: u32 = 3;

/// Largest " (n)" suffix tried when uniquifying an intermediate path.
pub const MAX_UNIQUIFY_ATTEMPTS: u32 = 100;

/// Read buffer used when re-hashing an existing partial file.
pub const REHASH_BUFFER_SIZE: usize = 32 * 1024;

/// Number of one-second buckets in the throughput estimator.
pub const RATE_WINDOW_BUCKETS: usize = 10;

/// Chunks the network pump may queue ahead of the destination writer.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Entries kept in a download's in-memory event log.
pub const EVENT_LOG_CAPACITY: usize = 256;

/// Extension appended to the target name for the in-progress file.
pub const INTERMEDIATE_EXTENSION: &str = "part";
