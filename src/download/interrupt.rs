//! Interrupt reasons and the single policy table that classifies them.
//!
//! Every failure a download can hit is reported as an [`InterruptReason`].
//! File and network layers only *report* a reason; what happens next is
//! decided by the item using [`InterruptReason::policy`].
//!
//! # Policy Table
//!
//! | Reason | Kind | Resumable | Restart | User action |
//! |--------|------|-----------|---------|-------------|
//! | `FileFailed` | FatalFile | yes | yes | yes |
//! | `FileAccessDenied` | FatalFile | yes | yes | yes |
//! | `FileNoSpace` | FatalFile | yes | no | yes |
//! | `FileNameTooLong` | FatalFile | yes | yes | yes |
//! | `FileTooLarge` | FatalFile | yes | yes | yes |
//! | `FileTransientError` | TransientFile | yes | no | no |
//! | `FileTooShort` | Integrity | yes | yes | no |
//! | `FileHashMismatch` | Integrity | yes | yes | no |
//! | `ServerNoRange` | Integrity | yes | yes | no |
//! | `NetworkTimeout` | TransientNetwork | yes | no | no |
//! | `NetworkFailed`, `NetworkDisconnected`, `NetworkServerDown` | TransientNetwork | yes | no | yes |
//! | `ServerFailed`, `ServerUnreachable` | TransientNetwork | yes | no | yes |
//! | `UserShutdown`, `Crash` | Unknown | yes | no | yes |
//! | `NetworkInvalidRequest`, `ServerBadContent`, `ServerUnauthorized`, `ServerCertProblem`, `ServerForbidden` | FatalNetwork | no | - | - |
//! | `FileVirusInfected`, `FileBlocked`, `FileSecurityCheckFailed`, `UserCanceled`, `UnsupportedScheme` | Policy | no | - | - |

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Why a download attempt stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptReason {
    FileFailed,
    FileAccessDenied,
    FileNoSpace,
    FileNameTooLong,
    FileTooLarge,
    FileVirusInfected,
    FileTransientError,
    FileBlocked,
    FileSecurityCheckFailed,
    FileTooShort,
    FileHashMismatch,
    NetworkFailed,
    NetworkTimeout,
    NetworkDisconnected,
    NetworkServerDown,
    NetworkInvalidRequest,
    ServerFailed,
    ServerNoRange,
    ServerBadContent,
    ServerUnauthorized,
    ServerCertProblem,
    ServerForbidden,
    ServerUnreachable,
    UserCanceled,
    UserShutdown,
    Crash,
    UnsupportedScheme,
}

/// Coarse error taxonomy derived from the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The network may recover on its own.
    TransientNetwork,
    /// The server rejected the request in a way a retry will not fix.
    FatalNetwork,
    /// A local file operation may succeed if retried shortly.
    TransientFile,
    /// The local file system cannot hold or accept the download.
    FatalFile,
    /// The partial data on disk or the server's range cannot be trusted.
    Integrity,
    /// Blocked by a user decision or a content policy.
    Policy,
    /// The cause is opaque (shutdown, crash).
    Unknown,
}

/// One row of the interrupt policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonPolicy {
    pub kind: ErrorKind,
    /// `false` means no resumption of any kind is possible.
    pub resumable: bool,
    /// Partial data must be discarded before resuming.
    pub forces_restart: bool,
    /// Resumption must wait for the user.
    pub forces_user_action: bool,
}

impl ReasonPolicy {
    const fn new(
        kind: ErrorKind,
        resumable: bool,
        forces_restart: bool,
        forces_user_action: bool,
    ) -> Self {
        Self {
            kind,
            resumable,
            forces_restart,
            forces_user_action,
        }
    }

    const fn not_resumable(kind: ErrorKind) -> Self {
        Self::new(kind, false, false, false)
    }
}

impl InterruptReason {
    /// Every reason, in declaration order.
    pub const ALL: [InterruptReason; 27] = [
        Self::FileFailed,
        Self::FileAccessDenied,
        Self::FileNoSpace,
        Self::FileNameTooLong,
        Self::FileTooLarge,
        Self::FileVirusInfected,
        Self::FileTransientError,
        Self::FileBlocked,
        Self::FileSecurityCheckFailed,
        Self::FileTooShort,
        Self::FileHashMismatch,
        Self::NetworkFailed,
        Self::NetworkTimeout,
        Self::NetworkDisconnected,
        Self::NetworkServerDown,
        Self::NetworkInvalidRequest,
        Self::ServerFailed,
        Self::ServerNoRange,
        Self::ServerBadContent,
        Self::ServerUnauthorized,
        Self::ServerCertProblem,
        Self::ServerForbidden,
        Self::ServerUnreachable,
        Self::UserCanceled,
        Self::UserShutdown,
        Self::Crash,
        Self::UnsupportedScheme,
    ];

    /// Looks up this reason's row in the policy table.
    ///
    /// This is the only place reason-specific resumption behavior is defined.
    #[must_use]
    pub const fn policy(self) -> ReasonPolicy {
        use ErrorKind::{
            FatalFile, FatalNetwork, Integrity, Policy, TransientFile, TransientNetwork, Unknown,
        };
        match self {
            Self::FileFailed
            | Self::FileAccessDenied
            | Self::FileNameTooLong
            | Self::FileTooLarge => ReasonPolicy::new(FatalFile, true, true, true),
            Self::FileNoSpace => ReasonPolicy::new(FatalFile, true, false, true),
            Self::FileTransientError => ReasonPolicy::new(TransientFile, true, false, false),
            Self::FileTooShort | Self::FileHashMismatch | Self::ServerNoRange => {
                ReasonPolicy::new(Integrity, true, true, false)
            }
            Self::NetworkTimeout => ReasonPolicy::new(TransientNetwork, true, false, false),
            Self::NetworkFailed
            | Self::NetworkDisconnected
            | Self::NetworkServerDown
            | Self::ServerFailed
            | Self::ServerUnreachable => ReasonPolicy::new(TransientNetwork, true, false, true),
            Self::UserShutdown | Self::Crash => ReasonPolicy::new(Unknown, true, false, true),
            Self::NetworkInvalidRequest
            | Self::ServerBadContent
            | Self::ServerUnauthorized
            | Self::ServerCertProblem
            | Self::ServerForbidden => ReasonPolicy::not_resumable(FatalNetwork),
            Self::FileVirusInfected
            | Self::FileBlocked
            | Self::FileSecurityCheckFailed
            | Self::UserCanceled
            | Self::UnsupportedScheme => ReasonPolicy::not_resumable(Policy),
        }
    }

    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        self.policy().kind
    }

    /// Reasons that end a download as cancelled rather than interrupted.
    #[must_use]
    pub const fn is_cancellation(self) -> bool {
        matches!(self, Self::UserCanceled | Self::UserShutdown)
    }

    /// Stable upper-case name, as persisted in download records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileFailed => "FILE_FAILED",
            Self::FileAccessDenied => "FILE_ACCESS_DENIED",
            Self::FileNoSpace => "FILE_NO_SPACE",
            Self::FileNameTooLong => "FILE_NAME_TOO_LONG",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::FileVirusInfected => "FILE_VIRUS_INFECTED",
            Self::FileTransientError => "FILE_TRANSIENT_ERROR",
            Self::FileBlocked => "FILE_BLOCKED",
            Self::FileSecurityCheckFailed => "FILE_SECURITY_CHECK_FAILED",
            Self::FileTooShort => "FILE_TOO_SHORT",
            Self::FileHashMismatch => "FILE_HASH_MISMATCH",
            Self::NetworkFailed => "NETWORK_FAILED",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::NetworkDisconnected => "NETWORK_DISCONNECTED",
            Self::NetworkServerDown => "NETWORK_SERVER_DOWN",
            Self::NetworkInvalidRequest => "NETWORK_INVALID_REQUEST",
            Self::ServerFailed => "SERVER_FAILED",
            Self::ServerNoRange => "SERVER_NO_RANGE",
            Self::ServerBadContent => "SERVER_BAD_CONTENT",
            Self::ServerUnauthorized => "SERVER_UNAUTHORIZED",
            Self::ServerCertProblem => "SERVER_CERT_PROBLEM",
            Self::ServerForbidden => "SERVER_FORBIDDEN",
            Self::ServerUnreachable => "SERVER_UNREACHABLE",
            Self::UserCanceled => "USER_CANCELED",
            Self::UserShutdown => "USER_SHUTDOWN",
            Self::Crash => "CRASH",
            Self::UnsupportedScheme => "UNSUPPORTED_SCHEME",
        }
    }

    /// Maps a file-system error onto the reason reported upward.
    ///
    /// | Error | Reason |
    /// |-------|--------|
    /// | permission denied | `FileAccessDenied` |
    /// | disk full / quota | `FileNoSpace` |
    /// | file too large | `FileTooLarge` |
    /// | name too long | `FileNameTooLong` |
    /// | too many open files, busy, interrupted | `FileTransientError` |
    /// | anything else | `FileFailed` |
    #[must_use]
    pub fn from_io_error(error: &io::Error) -> Self {
        if let Some(reason) = error.raw_os_error().and_then(from_os_error) {
            return reason;
        }
        match error.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::FileAccessDenied
            }
            io::ErrorKind::StorageFull => Self::FileNoSpace,
            io::ErrorKind::FileTooLarge => Self::FileTooLarge,
            io::ErrorKind::ResourceBusy
            | io::ErrorKind::ExecutableFileBusy
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Self::FileTransientError,
            _ => Self::FileFailed,
        }
    }
}

#[cfg(unix)]
fn from_os_error(code: i32) -> Option<InterruptReason> {
    match code {
        libc::ENAMETOOLONG => Some(InterruptReason::FileNameTooLong),
        libc::EMFILE | libc::ENFILE | libc::EBUSY | libc::ETXTBSY | libc::EAGAIN => {
            Some(InterruptReason::FileTransientError)
        }
        libc::ENOSPC | libc::EDQUOT => Some(InterruptReason::FileNoSpace),
        libc::EFBIG => Some(InterruptReason::FileTooLarge),
        libc::EACCES | libc::EPERM | libc::EROFS => Some(InterruptReason::FileAccessDenied),
        _ => None,
    }
}

#[cfg(not(unix))]
fn from_os_error(_code: i32) -> Option<InterruptReason> {
    None
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
