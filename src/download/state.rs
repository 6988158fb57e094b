//! Download lifecycle states and the legal transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal state of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    /// Created, writer not started yet.
    Initial,
    /// Writer running, waiting for the delegate to pick a target.
    TargetPending,
    /// Failed before a target was known; waiting for a target anyway.
    InterruptedTargetPending,
    /// Target known, intermediate rename done.
    TargetResolved,
    /// Receiving data.
    InProgress,
    /// All data saved, final rename done, waiting on the open gate.
    Completing,
    Complete,
    Cancelled,
    /// Stopped with partial data; may be resumed.
    Interrupted,
    /// Resumption requested, waiting for the new request to start.
    Resuming,
}

impl DownloadState {
    pub const ALL: [Self; 10] = [
        Self::Initial,
        Self::TargetPending,
        Self::InterruptedTargetPending,
        Self::TargetResolved,
        Self::InProgress,
        Self::Completing,
        Self::Complete,
        Self::Cancelled,
        Self::Interrupted,
        Self::Resuming,
    ];

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use DownloadState::{
            Cancelled, Complete, Completing, InProgress, Initial, Interrupted,
            InterruptedTargetPending, Resuming, TargetPending, TargetResolved,
        };
        matches!(
            (self, next),
            (Initial, TargetPending | InterruptedTargetPending | Cancelled)
                | (
                    TargetPending,
                    InterruptedTargetPending | TargetResolved | Cancelled
                )
                | (InterruptedTargetPending, Interrupted | Cancelled)
                | (TargetResolved, InProgress | Interrupted | Cancelled)
                | (InProgress, Completing | Interrupted | Cancelled)
                | (Completing, Complete)
                | (Interrupted, Resuming | Cancelled)
                | (
                    Resuming,
                    TargetPending | InterruptedTargetPending | TargetResolved | Cancelled
                )
        )
    }

    /// The coarse state reported to observers and persisted in records.
    #[must_use]
    pub const fn external(self) -> ExternalState {
        match self {
            Self::Complete => ExternalState::Complete,
            Self::Cancelled => ExternalState::Cancelled,
            Self::Interrupted => ExternalState::Interrupted,
            _ => ExternalState::InProgress,
        }
    }

    /// No transition leaves this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }

    /// The writer may be live in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::TargetPending
                | Self::InterruptedTargetPending
                | Self::TargetResolved
                | Self::InProgress
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::TargetPending => "TARGET_PENDING",
            Self::InterruptedTargetPending => "INTERRUPTED_TARGET_PENDING",
            Self::TargetResolved => "TARGET_RESOLVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completing => "COMPLETING",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::Interrupted => "INTERRUPTED",
            Self::Resuming => "RESUMING",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible download state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalState {
    InProgress,
    Complete,
    Cancelled,
    Interrupted,
}
