//! Contracts between a download item and the code embedding it.
//!
//! # Overview
//!
//! A [`DownloadItem`] never decides policy on its own. It asks its
//! [`DownloadDelegate`] where the file should go, whether it may complete or
//! be opened, and how to issue a resumption request. Answers come back
//! through one-shot callbacks ([`TargetCallback`], [`CompletionCallback`],
//! [`OpenCallback`], [`ResumptionCallback`]) that post onto the item's
//! control channel, so a delegate can answer synchronously or much later,
//! from any task.
//!
//! Each callback carries the item's generation at the time it was issued.
//! If the item moved on in the meantime (released its writer or started a
//! new resumption), the late answer is dropped.
//!
//! [`DownloadObserver`]s only watch: they are told about updates, opens,
//! removal and destruction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::control::{ControlEvent, ControlSink};
use super::hash::{ContentHash, HashState};
use super::interrupt::InterruptReason;
use super::item::DownloadItem;
use super::writer::DestinationWriter;

/// How the delegate wants an existing file at the target path handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetDisposition {
    #[default]
    Overwrite,
    Prompt,
    Uniquify,
}

/// Danger classification attached by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerType {
    #[default]
    NotDangerous,
    DangerousFile,
    DangerousUrl,
    DangerousContent,
    MaybeDangerousContent,
    UncommonContent,
    UserValidated,
    DangerousHost,
    PotentiallyUnwanted,
}

impl DangerType {
    /// Whether completion must wait for the user to validate the file.
    #[must_use]
    pub const fn is_dangerous(self) -> bool {
        !matches!(
            self,
            Self::NotDangerous | Self::MaybeDangerousContent | Self::UserValidated
        )
    }
}

/// Where a download should be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Final path. Empty means the download should be cancelled.
    pub target_path: PathBuf,
    pub disposition: TargetDisposition,
    pub danger_type: DangerType,
    /// Where data lives until completion.
    pub intermediate_path: PathBuf,
}

impl DownloadTarget {
    /// A target that cancels the download.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.target_path.as_os_str().is_empty()
    }
}

/// Everything known about a request when it starts (or fails to).
#[derive(Debug, Clone, Default)]
pub struct DownloadCreateInfo {
    /// `Some` when the request failed before producing data.
    pub result: Option<InterruptReason>,
    /// Redirect chain, original URL first.
    pub url_chain: Vec<String>,
    pub referrer: Option<String>,
    pub site_url: Option<String>,
    pub tab_url: Option<String>,
    pub tab_referrer_url: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
    pub mime_type: Option<String>,
    pub original_mime_type: Option<String>,
    pub remote_address: Option<String>,
    /// Total size if announced by the server, else 0.
    pub total_bytes: u64,
    /// Byte offset the response body starts at.
    pub offset: u64,
    pub hash_state: Option<HashState>,
    /// Path the download should initially be written to, if already known.
    pub save_path: Option<PathBuf>,
    /// Stable id to adopt; a fresh one is generated when `None`.
    pub guid: Option<String>,
    pub is_temporary: bool,
}

impl DownloadCreateInfo {
    /// Info for a request that failed with `reason` before producing data.
    #[must_use]
    pub fn failed(reason: InterruptReason) -> Self {
        Self {
            result: Some(reason),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url_chain.last().map(String::as_str)
    }
}

/// What a resumption request needs to continue where the last one stopped.
#[derive(Debug, Clone)]
pub struct ResumeParameters {
    pub url: String,
    pub referrer: Option<String>,
    /// The intermediate file to append to.
    pub file_path: Option<PathBuf>,
    /// Bytes already on disk. 0 for a restart.
    pub offset: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub hash_of_partial_file: Option<ContentHash>,
    /// Clone of the live hash, when the item still has one.
    pub hash_state: Option<HashState>,
    pub guid: String,
}

/// A live network request.
pub trait RequestHandle: Send {
    fn pause(&self);
    fn resume(&self);
    fn cancel(&self);
}

/// One-shot answer to [`DownloadDelegate::determine_target`].
#[derive(Debug)]
pub struct TargetCallback {
    sink: ControlSink,
}

impl TargetCallback {
    pub(crate) fn new(sink: ControlSink) -> Self {
        Self { sink }
    }

    /// Delivers the target. An empty `target_path` cancels the download.
    pub fn run(self, target: DownloadTarget) {
        let generation = self.sink.generation();
        self.sink
            .post(ControlEvent::TargetDetermined { generation, target });
    }
}

/// Re-polls [`DownloadDelegate::should_complete_download`].
#[derive(Debug)]
pub struct CompletionCallback {
    sink: ControlSink,
}

impl CompletionCallback {
    pub(crate) fn new(sink: ControlSink) -> Self {
        Self { sink }
    }

    pub fn run(self) {
        let generation = self.sink.generation();
        self.sink.post(ControlEvent::CompletionReady { generation });
    }
}

/// Finishes a delayed [`DownloadDelegate::should_open_download`].
#[derive(Debug)]
pub struct OpenCallback {
    sink: ControlSink,
}

impl OpenCallback {
    pub(crate) fn new(sink: ControlSink) -> Self {
        Self { sink }
    }

    /// `auto_opened` records that the delegate already opened the file.
    pub fn run(self, auto_opened: bool) {
        let generation = self.sink.generation();
        self.sink.post(ControlEvent::OpenReady {
            generation,
            auto_opened,
        });
    }
}

/// Reports the outcome of [`DownloadDelegate::resume_interrupted_download`].
#[derive(Debug)]
pub struct ResumptionCallback {
    sink: ControlSink,
}

impl ResumptionCallback {
    pub(crate) fn new(sink: ControlSink) -> Self {
        Self { sink }
    }

    /// The new request is running; `writer` drains its body.
    pub fn started(
        self,
        writer: DestinationWriter,
        request: Box<dyn RequestHandle>,
        info: DownloadCreateInfo,
    ) {
        self.sink.post(ControlEvent::Started {
            writer: Some(writer),
            request: Some(request),
            info,
        });
    }

    /// The request could not be issued or failed before any data arrived.
    pub fn failed(self, reason: InterruptReason, mut info: DownloadCreateInfo) {
        info.result = Some(reason);
        self.sink.post(ControlEvent::Started {
            writer: None,
            request: None,
            info,
        });
    }
}

/// Policy hooks supplied by the embedder.
pub trait DownloadDelegate: Send + Sync {
    /// Picks the target for `item` and answers through `callback`.
    fn determine_target(&self, item: &DownloadItem, callback: TargetCallback);

    /// Returns `false` to hold completion; call `callback` to ask again.
    fn should_complete_download(&self, item: &DownloadItem, callback: CompletionCallback) -> bool {
        let _ = (item, callback);
        true
    }

    /// Returns `false` to hold the final transition; call `callback` when done.
    fn should_open_download(&self, item: &DownloadItem, callback: OpenCallback) -> bool {
        let _ = (item, callback);
        true
    }

    /// Issues a request continuing `params` and reports through `callback`.
    fn resume_interrupted_download(
        &self,
        params: ResumeParameters,
        download_id: u32,
        callback: ResumptionCallback,
    );

    fn open_download(&self, item: &DownloadItem) {
        let _ = item;
    }

    fn download_removed(&self, item: &DownloadItem) {
        let _ = item;
    }
}

/// Passive watcher of a download item.
///
/// Callbacks run on the item's control task. An observer may remove itself
/// (or others) from inside a callback; the change applies from the next
/// dispatch.
pub trait DownloadObserver: Send + Sync {
    fn on_updated(&self, item: &DownloadItem) {
        let _ = item;
    }

    fn on_opened(&self, item: &DownloadItem) {
        let _ = item;
    }

    fn on_removed(&self, item: &DownloadItem) {
        let _ = item;
    }

    fn on_destroyed(&self, item: &DownloadItem) {
        let _ = item;
    }
}

/// Returns `path` unless it is empty.
pub(crate) fn non_empty(path: &Path) -> Option<&Path> {
    (!path.as_os_str().is_empty()).then_some(path)
}
