//! Resume-mode decision for interrupted downloads.
//!
//! [`resume_mode`] is a pure function of the last interrupt reason and a
//! snapshot of the item ([`ResumeContext`]). The item is the only caller;
//! writers and file handles never decide resumability.

use serde::{Deserialize, Serialize};

use super::interrupt::InterruptReason;

/// How (and whether) an interrupted download may be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResumeMode {
    /// Not resumable.
    Invalid,
    /// Resume automatically from the current offset.
    ImmediateContinue,
    /// Resume automatically after discarding partial data.
    ImmediateRestart,
    /// Wait for the user, then continue from the current offset.
    UserContinue,
    /// Wait for the user, then start over.
    UserRestart,
}

impl ResumeMode {
    #[must_use]
    pub const fn is_immediate(self) -> bool {
        matches!(self, Self::ImmediateContinue | Self::ImmediateRestart)
    }

    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::UserContinue | Self::UserRestart)
    }

    #[must_use]
    pub const fn is_restart(self) -> bool {
        matches!(self, Self::ImmediateRestart | Self::UserRestart)
    }

    /// Whether the intermediate file is kept when the writer is released.
    #[must_use]
    pub const fn keeps_partial_file(self) -> bool {
        matches!(self, Self::ImmediateContinue | Self::UserContinue)
    }
}

/// Item facts the resume decision depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeContext {
    /// The download URL uses http or https.
    pub http_scheme: bool,
    /// An intermediate file path is known.
    pub has_intermediate_file: bool,
    /// An etag or a last-modified value is known.
    pub has_validators: bool,
    /// The automatic resumption budget is used up.
    pub auto_resume_exhausted: bool,
    /// The user paused the download.
    pub paused: bool,
    /// Local corruption was detected and must be acknowledged by the user.
    pub integrity_hold: bool,
}

impl ResumeContext {
    /// Whether partial data must be discarded regardless of the reason.
    #[must_use]
    pub const fn restart_required(&self) -> bool {
        !self.has_intermediate_file || !self.has_validators
    }

    /// Whether the user must act regardless of the reason.
    #[must_use]
    pub const fn user_action_required(&self) -> bool {
        self.auto_resume_exhausted || self.paused || self.integrity_hold
    }
}

/// Decides how an interrupted download may resume.
///
/// Non-HTTP(S) downloads and non-resumable reasons are [`ResumeMode::Invalid`].
/// Otherwise the reason's forced flags are OR-ed into the context flags:
///
/// | restart | user action | mode |
/// |---------|-------------|------|
/// | no | no | `ImmediateContinue` |
/// | yes | no | `ImmediateRestart` |
/// | no | yes | `UserContinue` |
/// | yes | yes | `UserRestart` |
#[must_use]
pub fn resume_mode(reason: Option<InterruptReason>, context: &ResumeContext) -> ResumeMode {
    let Some(reason) = reason else {
        return ResumeMode::Invalid;
    };
    if !context.http_scheme {
        return ResumeMode::Invalid;
    }
    let policy = reason.policy();
    if !policy.resumable {
        return ResumeMode::Invalid;
    }

    let restart = context.restart_required() || policy.forces_restart;
    let user = context.user_action_required() || policy.forces_user_action;

    match (restart, user) {
        (false, false) => ResumeMode::ImmediateContinue,
        (true, false) => ResumeMode::ImmediateRestart,
        (false, true) => ResumeMode::UserContinue,
        (true, true) => ResumeMode::UserRestart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(restart_required: bool, user_action_required: bool) -> ResumeContext {
        ResumeContext {
            http_scheme: true,
            has_intermediate_file: !restart_required,
            has_validators: true,
            auto_resume_exhausted: user_action_required,
            paused: false,
            integrity_hold: false,
        }
    }

    // ==================== Resume Mode Table Tests ====================

    #[test]
    fn test_resume_mode_table_for_every_reason() {
        use InterruptReason as R;
        use ResumeMode::{
            ImmediateContinue as IC, ImmediateRestart as IR, Invalid as X, UserContinue as UC,
            UserRestart as UR,
        };

        // Columns: partial file kept, no partial file, budget exhausted.
        let table: [(InterruptReason, [ResumeMode; 3]); 27] = [
            (R::FileFailed, [UR, UR, UR]),
            (R::FileAccessDenied, [UR, UR, UR]),
            (R::FileNoSpace, [UC, UR, UC]),
            (R::FileNameTooLong, [UR, UR, UR]),
            (R::FileTooLarge, [UR, UR, UR]),
            (R::FileVirusInfected, [X, X, X]),
            (R::FileTransientError, [IC, IR, UC]),
            (R::FileBlocked, [X, X, X]),
            (R::FileSecurityCheckFailed, [X, X, X]),
            (R::FileTooShort, [IR, IR, UR]),
            (R::FileHashMismatch, [IR, IR, UR]),
            (R::NetworkFailed, [UC, UR, UC]),
            (R::NetworkTimeout, [IC, IR, UC]),
            (R::NetworkDisconnected, [UC, UR, UC]),
            (R::NetworkServerDown, [UC, UR, UC]),
            (R::NetworkInvalidRequest, [X, X, X]),
            (R::ServerFailed, [UC, UR, UC]),
            (R::ServerNoRange, [IR, IR, UR]),
            (R::ServerBadContent, [X, X, X]),
            (R::ServerUnauthorized, [X, X, X]),
            (R::ServerCertProblem, [X, X, X]),
            (R::ServerForbidden, [X, X, X]),
            (R::ServerUnreachable, [UC, UR, UC]),
            (R::UserCanceled, [X, X, X]),
            (R::UserShutdown, [UC, UR, UC]),
            (R::Crash, [UC, UR, UC]),
            (R::UnsupportedScheme, [X, X, X]),
        ];
        assert!(
            InterruptReason::ALL
                .iter()
                .all(|reason| table.iter().any(|(row, _)| row == reason))
        );

        let contexts = [
            context(false, false),
            context(true, false),
            context(false, true),
        ];
        for (reason, expected) in table {
            for (ctx, want) in contexts.iter().zip(expected) {
                assert_eq!(resume_mode(Some(reason), ctx), want, "{reason} {ctx:?}");
            }
        }
    }

    #[test]
    fn test_network_timeout_with_validators_continues_immediately() {
        let mode = resume_mode(Some(InterruptReason::NetworkTimeout), &context(false, false));
        assert_eq!(mode, ResumeMode::ImmediateContinue);
    }

    #[test]
    fn test_hash_mismatch_always_restarts() {
        let mode = resume_mode(
            Some(InterruptReason::FileHashMismatch),
            &context(false, false),
        );
        assert_eq!(mode, ResumeMode::ImmediateRestart);
    }

    #[test]
    fn test_exhausted_budget_requires_user() {
        let mode = resume_mode(Some(InterruptReason::NetworkTimeout), &context(false, true));
        assert_eq!(mode, ResumeMode::UserContinue);
    }

    #[test]
    fn test_no_space_needs_user_but_keeps_data() {
        let mode = resume_mode(Some(InterruptReason::FileNoSpace), &context(false, false));
        assert_eq!(mode, ResumeMode::UserContinue);
        assert!(mode.keeps_partial_file());
    }

    #[test]
    fn test_access_denied_needs_user_restart() {
        let mode = resume_mode(
            Some(InterruptReason::FileAccessDenied),
            &context(false, false),
        );
        assert_eq!(mode, ResumeMode::UserRestart);
    }

    #[test]
    fn test_missing_validators_force_restart() {
        let ctx = ResumeContext {
            has_validators: false,
            ..context(false, false)
        };
        let mode = resume_mode(Some(InterruptReason::NetworkTimeout), &ctx);
        assert_eq!(mode, ResumeMode::ImmediateRestart);
    }

    #[test]
    fn test_integrity_hold_requires_user_restart() {
        let ctx = ResumeContext {
            integrity_hold: true,
            ..context(false, false)
        };
        let mode = resume_mode(Some(InterruptReason::FileHashMismatch), &ctx);
        assert_eq!(mode, ResumeMode::UserRestart);
    }

    #[test]
    fn test_paused_requires_user() {
        let ctx = ResumeContext {
            paused: true,
            ..context(false, false)
        };
        let mode = resume_mode(Some(InterruptReason::NetworkTimeout), &ctx);
        assert_eq!(mode, ResumeMode::UserContinue);
    }

    #[test]
    fn test_non_http_scheme_is_invalid() {
        let ctx = ResumeContext {
            http_scheme: false,
            ..context(false, false)
        };
        assert_eq!(
            resume_mode(Some(InterruptReason::NetworkTimeout), &ctx),
            ResumeMode::Invalid
        );
    }

    #[test]
    fn test_no_reason_is_invalid() {
        assert_eq!(resume_mode(None, &context(false, false)), ResumeMode::Invalid);
    }

    #[test]
    fn test_user_cancel_is_invalid() {
        assert_eq!(
            resume_mode(Some(InterruptReason::UserCanceled), &context(false, false)),
            ResumeMode::Invalid
        );
    }
}
