//! The control channel every writer and delegate callback posts into.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use super::delegate::{DownloadCreateInfo, DownloadTarget, RequestHandle};
use super::writer::{DestinationWriter, WriterEvent, WriterObserver};

/// Message processed on an item's control task.
pub(crate) enum ControlEvent {
    Writer {
        generation: u64,
        event: WriterEvent,
    },
    TargetDetermined {
        generation: u64,
        target: DownloadTarget,
    },
    CompletionReady {
        generation: u64,
    },
    OpenReady {
        generation: u64,
        auto_opened: bool,
    },
    Started {
        writer: Option<DestinationWriter>,
        request: Option<Box<dyn RequestHandle>>,
        info: DownloadCreateInfo,
    },
    AutoResumeDue {
        generation: u64,
    },
}

impl fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writer { generation, event } => f
                .debug_struct("Writer")
                .field("generation", generation)
                .field("event", event)
                .finish(),
            Self::TargetDetermined { generation, target } => f
                .debug_struct("TargetDetermined")
                .field("generation", generation)
                .field("target", target)
                .finish(),
            Self::CompletionReady { generation } => f
                .debug_struct("CompletionReady")
                .field("generation", generation)
                .finish(),
            Self::OpenReady {
                generation,
                auto_opened,
            } => f
                .debug_struct("OpenReady")
                .field("generation", generation)
                .field("auto_opened", auto_opened)
                .finish(),
            Self::Started { writer, info, .. } => f
                .debug_struct("Started")
                .field("has_writer", &writer.is_some())
                .field("result", &info.result)
                .finish_non_exhaustive(),
            Self::AutoResumeDue { generation } => f
                .debug_struct("AutoResumeDue")
                .field("generation", generation)
                .finish(),
        }
    }
}

/// Sender bound to the generation it was issued in.
#[derive(Debug, Clone)]
pub(crate) struct ControlSink {
    tx: mpsc::UnboundedSender<ControlEvent>,
    generation: u64,
}

impl ControlSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn post(&self, event: ControlEvent) {
        if let Err(error) = self.tx.send(event) {
            debug!(event = ?error.0, "download item gone, dropping event");
        }
    }
}

impl WriterObserver for ControlSink {
    fn on_writer_event(&self, event: WriterEvent) {
        self.post(ControlEvent::Writer {
            generation: self.generation,
            event,
        });
    }
}
