//! Error types for the download module.
//!
//! Every error that can interrupt a download carries the [`InterruptReason`]
//! it maps to, so the item can feed it straight into the resume decision.

use std::path::PathBuf;

use thiserror::Error;

use super::interrupt::InterruptReason;

/// Errors raised by file handles and destination writers.
#[derive(Debug, Error)]
pub enum FileError {
    /// An OS-level file operation failed.
    #[error("{reason} at {path}: {source}")]
    Io {
        /// Classified reason for the failure.
        reason: InterruptReason,
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A file operation failed for a reason detected by the engine itself.
    #[error("{reason} at {path}: {detail}")]
    Failed {
        /// Classified reason for the failure.
        reason: InterruptReason,
        /// The file path where the error occurred.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },

    /// The on-disk prefix does not match what the caller expected.
    #[error("integrity check failed for {path}: {reason} (expected {expected_bytes} bytes)")]
    Integrity {
        /// `FileTooShort` or `FileHashMismatch`.
        reason: InterruptReason,
        /// The partial file that failed verification.
        path: PathBuf,
        /// Number of bytes the caller claimed were already saved.
        expected_bytes: u64,
    },
}

impl FileError {
    /// Creates an IO error, classifying the reason from the OS error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            reason: InterruptReason::from_io_error(&source),
            path: path.into(),
            source,
        }
    }

    /// Creates an error with an explicit reason.
    pub fn failed(
        reason: InterruptReason,
        path: impl Into<PathBuf>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Failed {
            reason,
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates a `FileTooShort` integrity error.
    pub fn too_short(path: impl Into<PathBuf>, expected_bytes: u64) -> Self {
        Self::Integrity {
            reason: InterruptReason::FileTooShort,
            path: path.into(),
            expected_bytes,
        }
    }

    /// Creates a `FileHashMismatch` integrity error.
    pub fn hash_mismatch(path: impl Into<PathBuf>, expected_bytes: u64) -> Self {
        Self::Integrity {
            reason: InterruptReason::FileHashMismatch,
            path: path.into(),
            expected_bytes,
        }
    }

    /// The interrupt reason this error reports upward.
    #[must_use]
    pub fn reason(&self) -> InterruptReason {
        match self {
            Self::Io { reason, .. } | Self::Failed { reason, .. } | Self::Integrity { reason, .. } => {
                *reason
            }
        }
    }
}

/// Errors raised while issuing a download request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Only http and https downloads can be issued (and resumed).
    #[error("unsupported scheme for {url}")]
    UnsupportedScheme {
        /// The rejected URL.
        url: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// Classified reason for the failure.
        reason: InterruptReason,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the response arrived.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// A range request was answered with something other than the requested range.
    #[error("server ignored range request for {url} at offset {offset} (HTTP {status})")]
    NoRange {
        /// The URL that was requested.
        url: String,
        /// The offset that was requested.
        offset: u64,
        /// The status the server answered with.
        status: u16,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Client {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl RequestError {
    /// Creates a network error, classifying the reason from the reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let reason = if is_tls_error(&source) {
            InterruptReason::ServerCertProblem
        } else if source.is_connect() {
            InterruptReason::ServerUnreachable
        } else {
            InterruptReason::NetworkFailed
        };
        Self::Network {
            url: url.into(),
            reason,
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// The interrupt reason this error reports to the item.
    ///
    /// # HTTP Status Code Mapping
    ///
    /// | Status | Reason |
    /// |--------|--------|
    /// | 401, 407 | `ServerUnauthorized` |
    /// | 403 | `ServerForbidden` |
    /// | 404, 410 | `ServerBadContent` |
    /// | 416 | `ServerNoRange` |
    /// | 400 | `NetworkInvalidRequest` |
    /// | other | `ServerFailed` |
    #[must_use]
    pub fn reason(&self) -> InterruptReason {
        match self {
            Self::InvalidUrl { .. } => InterruptReason::NetworkInvalidRequest,
            Self::UnsupportedScheme { .. } => InterruptReason::UnsupportedScheme,
            Self::Network { reason, .. } => *reason,
            Self::Timeout { .. } => InterruptReason::NetworkTimeout,
            Self::HttpStatus { status, .. } => reason_for_status(*status),
            Self::NoRange { .. } => InterruptReason::ServerNoRange,
            Self::Client { .. } => InterruptReason::NetworkFailed,
        }
    }
}

#[allow(clippy::match_same_arms)]
fn reason_for_status(status: u16) -> InterruptReason {
    match status {
        400 => InterruptReason::NetworkInvalidRequest,
        401 => InterruptReason::ServerUnauthorized,
        403 => InterruptReason::ServerForbidden,
        404 => InterruptReason::ServerBadContent,
        407 => InterruptReason::ServerUnauthorized,
        410 => InterruptReason::ServerBadContent,
        416 => InterruptReason::ServerNoRange,
        _ => InterruptReason::ServerFailed,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Errors raised when restoring a persisted download record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record's GUID is not a valid UUID.
    #[error("invalid download GUID: {guid}")]
    InvalidGuid {
        /// The rejected GUID text.
        guid: String,
    },

    /// The stored hash is not valid hex of the right length.
    #[error("invalid stored hash: {value}")]
    InvalidHash {
        /// The rejected hash text.
        value: String,
    },

    /// A record must have at least one URL.
    #[error("download record has an empty URL chain")]
    EmptyUrlChain,

    /// The record could not be (de)serialized.
    #[error("failed to (de)serialize download record: {source}")]
    Json {
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl RecordError {
    /// Creates a JSON error.
    pub fn json(source: serde_json::Error) -> Self {
        Self::Json { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_error_io_classifies_reason() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = FileError::io("/path/to/file", io_err);
        assert_eq!(err.reason(), InterruptReason::FileAccessDenied);
        assert!(err.to_string().contains("/path/to/file"));
        assert!(err.to_string().contains("FILE_ACCESS_DENIED"));
    }

    #[test]
    fn test_file_error_integrity_reasons() {
        assert_eq!(
            FileError::too_short("/f", 10).reason(),
            InterruptReason::FileTooShort
        );
        assert_eq!(
            FileError::hash_mismatch("/f", 10).reason(),
            InterruptReason::FileHashMismatch
        );
    }

    #[test]
    fn test_request_error_status_mapping() {
        let cases = [
            (400, InterruptReason::NetworkInvalidRequest),
            (401, InterruptReason::ServerUnauthorized),
            (403, InterruptReason::ServerForbidden),
            (404, InterruptReason::ServerBadContent),
            (407, InterruptReason::ServerUnauthorized),
            (416, InterruptReason::ServerNoRange),
            (500, InterruptReason::ServerFailed),
            (503, InterruptReason::ServerFailed),
        ];
        for (status, expected) in cases {
            let err = RequestError::http_status("http://example.com", status);
            assert_eq!(err.reason(), expected, "status {status}");
        }
    }

    #[test]
    fn test_request_error_timeout_and_url() {
        assert_eq!(
            RequestError::timeout("http://example.com").reason(),
            InterruptReason::NetworkTimeout
        );
        assert_eq!(
            RequestError::invalid_url("nope").reason(),
            InterruptReason::NetworkInvalidRequest
        );
        let err = RequestError::UnsupportedScheme {
            url: "ftp://example.com/f".to_string(),
        };
        assert_eq!(err.reason(), InterruptReason::UnsupportedScheme);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("progress_interval", "must be non-zero");
        assert_eq!(
            err.to_string(),
            "invalid value for progress_interval: must be non-zero"
        );
    }
}

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, FileError>` (etc.) explicitly in function signatures.
