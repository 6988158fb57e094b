//! Bounded per-item history, mirrored to `tracing`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::constants::EVENT_LOG_CAPACITY;
use super::delegate::DangerType;
use super::interrupt::InterruptReason;
use super::resume::ResumeMode;
use super::state::DownloadState;

/// Who asked for a resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOrigin {
    Automatic,
    User,
}

/// Why a dangerous download was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardCause {
    UserCancel,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemEvent {
    StateChanged {
        from: DownloadState,
        to: DownloadState,
    },
    Renamed {
        to: PathBuf,
        retries: u32,
    },
    Interrupted {
        reason: InterruptReason,
        received_bytes: u64,
    },
    Resumed {
        origin: ResumeOrigin,
        mode: ResumeMode,
    },
    OriginChanged {
        additional_redirects: bool,
        validators_changed: bool,
        content_disposition_changed: bool,
    },
    DangerousDiscarded {
        cause: DiscardCause,
        danger: DangerType,
    },
    Completed {
        total_bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub at: SystemTime,
    pub event: ItemEvent,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    guid: String,
    entries: VecDeque<LoggedEvent>,
    capacity: usize,
}

impl EventLog {
    #[must_use]
    pub fn new(guid: impl Into<String>) -> Self {
        Self::with_capacity(guid, EVENT_LOG_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(guid: impl Into<String>, capacity: usize) -> Self {
        Self {
            guid: guid.into(),
            entries: VecDeque::with_capacity(capacity.min(EVENT_LOG_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: ItemEvent) {
        self.trace(&event);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LoggedEvent {
            at: SystemTime::now(),
            event,
        });
    }

    fn trace(&self, event: &ItemEvent) {
        let guid = self.guid.as_str();
        match event {
            ItemEvent::StateChanged { from, to } => {
                debug!(guid, %from, %to, "state changed");
            }
            ItemEvent::Renamed { to, retries } if *retries > 0 => {
                info!(guid, to = %to.display(), retries, "rename succeeded after retry");
            }
            ItemEvent::Renamed { to, .. } => debug!(guid, to = %to.display(), "renamed"),
            ItemEvent::Interrupted {
                reason,
                received_bytes,
            } => info!(guid, %reason, received_bytes, "download interrupted"),
            ItemEvent::Resumed { origin, mode } => {
                info!(guid, ?origin, ?mode, "resuming download");
            }
            ItemEvent::OriginChanged {
                additional_redirects: false,
                validators_changed: false,
                content_disposition_changed: false,
            } => debug!(guid, "origin unchanged on resumption"),
            ItemEvent::OriginChanged {
                additional_redirects,
                validators_changed,
                content_disposition_changed,
            } => warn!(
                guid,
                additional_redirects,
                validators_changed,
                content_disposition_changed,
                "origin changed on resumption"
            ),
            ItemEvent::DangerousDiscarded { cause, danger } => {
                info!(guid, ?cause, ?danger, "dangerous download discarded");
            }
            ItemEvent::Completed { total_bytes } => {
                info!(guid, total_bytes, "download complete");
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    #[must_use]
    pub fn entries(&self) -> &VecDeque<LoggedEvent> {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The sequence of states visited, starting from the first recorded one.
    #[must_use]
    pub fn state_path(&self) -> Vec<DownloadState> {
        let mut path = Vec::new();
        for event in self.iter() {
            if let ItemEvent::StateChanged { from, to } = event {
                if path.is_empty() {
                    path.push(*from);
                }
                path.push(*to);
            }
        }
        path
    }
}
