//! Exit code logic for the downloader process.
//!
//! Single responsibility: map the item's final state to the process exit outcome.

use resumable_downloader_core::download::{DownloadState, ResumeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    /// Stopped with data kept; running again continues.
    Resumable,
    Failure,
}

impl ProcessExit {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Resumable => 2,
        }
    }
}

pub(crate) fn determine_exit_outcome(state: DownloadState, mode: ResumeMode) -> ProcessExit {
    match state {
        DownloadState::Complete => ProcessExit::Success,
        DownloadState::Interrupted if mode.is_user() => ProcessExit::Resumable,
        _ => ProcessExit::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_outcome_success_when_complete() {
        assert_eq!(
            determine_exit_outcome(DownloadState::Complete, ResumeMode::Invalid),
            ProcessExit::Success
        );
    }

    #[test]
    fn test_exit_outcome_resumable_when_user_can_continue() {
        assert_eq!(
            determine_exit_outcome(DownloadState::Interrupted, ResumeMode::UserContinue),
            ProcessExit::Resumable
        );
        assert_eq!(ProcessExit::Resumable.code(), 2);
    }

    #[test]
    fn test_exit_outcome_failure_otherwise() {
        assert_eq!(
            determine_exit_outcome(DownloadState::Interrupted, ResumeMode::Invalid),
            ProcessExit::Failure
        );
        assert_eq!(
            determine_exit_outcome(DownloadState::Cancelled, ResumeMode::Invalid),
            ProcessExit::Failure
        );
    }
}
