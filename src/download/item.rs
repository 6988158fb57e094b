//! The download item: one download's lifecycle, from first byte to final name.
//!
//! # Overview
//!
//! A [`DownloadItem`] is owned by a single control task. Everything that
//! happens elsewhere (the writer draining bytes, the delegate picking a
//! target, a resumption request starting) arrives as a message on the item's
//! control channel and is applied by [`DownloadItem::next_event`]. All state
//! transitions happen there, and only the ones allowed by
//! [`DownloadState::can_transition_to`].
//!
//! # Lifecycle
//!
//! ```text
//! Initial -> TargetPending -> TargetResolved -> InProgress -> Completing -> Complete
//!                 |                 |               |
//!                 v                 v               v
//!   InterruptedTargetPending ---> Interrupted <-----+
//!                                   |    ^
//!                                   v    |
//!                                  Resuming
//! ```
//!
//! Any non-terminal state can move to `Cancelled`.
//!
//! # Interruption
//!
//! When an attempt fails, the item classifies the reason with
//! [`resume_mode`](super::resume::resume_mode). Continue modes keep the
//! intermediate file; restart modes delete it. Immediate modes resume on
//! their own (up to the configured number of attempts, spaced by the
//! auto-resume backoff); user modes wait for [`DownloadItem::resume`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::config::{EngineConfig, OriginChangePolicy};
use super::control::{ControlEvent, ControlSink};
use super::delegate::{
    CompletionCallback, DangerType, DownloadCreateInfo, DownloadDelegate, DownloadObserver,
    DownloadTarget, OpenCallback, RequestHandle, ResumeParameters, ResumptionCallback,
    TargetCallback, TargetDisposition, non_empty,
};
use super::error::RecordError;
use super::event_log::{DiscardCause, EventLog, ItemEvent, ResumeOrigin};
use super::hash::{ContentHash, HashState};
use super::interrupt::{ErrorKind, InterruptReason};
use super::record::{DownloadRecord, from_epoch_secs, to_epoch_secs};
use super::resume::{ResumeContext, ResumeMode, resume_mode};
use super::state::{DownloadState, ExternalState};
use super::writer::{DestinationWriter, DetachCallback, RenameKind, WriterEvent, WriterHandle};

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn DownloadObserver>)>,
}

/// Shared list of observers. Cloning yields another handle to the same list,
/// which lets an observer unregister itself from inside a callback.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<ObserverList>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl ObserverRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, ObserverList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        let mut list = self.lock();
        let id = ObserverId(list.next_id);
        list.next_id += 1;
        list.entries.push((id, observer));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut list = self.lock();
        let before = list.entries.len();
        list.entries.retain(|(entry, _)| *entry != id);
        list.entries.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DownloadObserver>> {
        self.lock()
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }
}

/// One download and its state machine.
pub struct DownloadItem {
    id: u32,
    guid: String,

    url_chain: Vec<String>,
    referrer: Option<String>,
    site_url: Option<String>,
    tab_url: Option<String>,
    tab_referrer_url: Option<String>,
    mime_type: Option<String>,
    original_mime_type: Option<String>,
    content_disposition: Option<String>,
    remote_address: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,

    target_path: PathBuf,
    target_disposition: TargetDisposition,
    current_path: PathBuf,

    received_bytes: u64,
    total_bytes: u64,
    bytes_per_sec: u64,
    hash: Option<ContentHash>,
    hash_state: Option<HashState>,

    danger_type: DangerType,
    last_reason: Option<InterruptReason>,
    destination_error: Option<InterruptReason>,
    state: DownloadState,
    auto_resume_count: u32,
    paused: bool,
    all_data_saved: bool,
    integrity_hold: bool,
    opened: bool,
    auto_opened: bool,
    open_when_complete: bool,
    is_temporary: bool,
    file_externally_removed: bool,
    delayed_complete: bool,
    start_time: SystemTime,
    end_time: Option<SystemTime>,

    writer: Option<WriterHandle>,
    request: Option<Box<dyn RequestHandle>>,
    delegate: Arc<dyn DownloadDelegate>,
    config: EngineConfig,
    generation: u64,
    tx: mpsc::UnboundedSender<ControlEvent>,
    rx: mpsc::UnboundedReceiver<ControlEvent>,
    observers: ObserverRegistry,
    events: EventLog,
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadItem")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("state", &self.state)
            .field("url", &self.url())
            .field("current_path", &self.current_path)
            .field("target_path", &self.target_path)
            .field("received_bytes", &self.received_bytes)
            .field("total_bytes", &self.total_bytes)
            .field("last_reason", &self.last_reason)
            .field("auto_resume_count", &self.auto_resume_count)
            .finish_non_exhaustive()
    }
}

impl DownloadItem {
    /// Creates an item for a new download described by `info`.
    ///
    /// The item stays in `Initial` until [`DownloadItem::start`] is called.
    #[must_use]
    pub fn new(
        id: u32,
        info: &DownloadCreateInfo,
        delegate: Arc<dyn DownloadDelegate>,
        config: EngineConfig,
    ) -> Self {
        let guid = info
            .guid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string().to_uppercase());
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            events: EventLog::new(guid.clone()),
            guid,
            url_chain: info.url_chain.clone(),
            referrer: info.referrer.clone(),
            site_url: info.site_url.clone(),
            tab_url: info.tab_url.clone(),
            tab_referrer_url: info.tab_referrer_url.clone(),
            mime_type: info.mime_type.clone(),
            original_mime_type: info.original_mime_type.clone(),
            content_disposition: info.content_disposition.clone(),
            remote_address: info.remote_address.clone(),
            etag: info.etag.clone(),
            last_modified: info.last_modified.clone(),
            target_path: PathBuf::new(),
            target_disposition: TargetDisposition::default(),
            current_path: PathBuf::new(),
            received_bytes: 0,
            total_bytes: info.total_bytes,
            bytes_per_sec: 0,
            hash: None,
            hash_state: None,
            danger_type: DangerType::NotDangerous,
            last_reason: None,
            destination_error: None,
            state: DownloadState::Initial,
            auto_resume_count: 0,
            paused: false,
            all_data_saved: false,
            integrity_hold: false,
            opened: false,
            auto_opened: false,
            open_when_complete: false,
            is_temporary: info.is_temporary,
            file_externally_removed: false,
            delayed_complete: false,
            start_time: SystemTime::now(),
            end_time: None,
            writer: None,
            request: None,
            delegate,
            config,
            generation: 0,
            tx,
            rx,
            observers: ObserverRegistry::default(),
        }
    }

    // ==================== Event loop ====================

    /// Waits for the next control message and applies it.
    pub async fn next_event(&mut self) {
        // `self.tx` keeps the channel open, so `recv` never yields `None`.
        if let Some(event) = self.rx.recv().await {
            self.handle_event(event);
        }
    }

    /// Applies control messages until `done` returns `true`.
    pub async fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&Self) -> bool,
    {
        while !done(self) {
            self.next_event().await;
        }
    }

    /// Applies every message already queued, without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Started {
                writer,
                request,
                info,
            } => self.start(writer, request, info),
            ControlEvent::Writer { generation, event } if generation == self.generation => {
                self.on_writer_event(event);
            }
            ControlEvent::TargetDetermined { generation, target }
                if generation == self.generation =>
            {
                self.on_target_determined(target);
            }
            ControlEvent::CompletionReady { generation } if generation == self.generation => {
                self.maybe_complete_download();
            }
            ControlEvent::OpenReady {
                generation,
                auto_opened,
            } if generation == self.generation => self.on_delayed_open(auto_opened),
            ControlEvent::AutoResumeDue { generation } if generation == self.generation => {
                self.resume_interrupted_download(ResumeOrigin::Automatic);
            }
            stale => debug!(event = ?stale, generation = self.generation, "dropping stale event"),
        }
    }

    fn sink(&self) -> ControlSink {
        ControlSink::new(self.tx.clone(), self.generation)
    }

    // ==================== Start ====================

    /// Attaches a request to the item.
    ///
    /// `info.result` set means the request failed before producing data; the
    /// item then goes to `Interrupted` (through `InterruptedTargetPending`
    /// when no target is known yet). Otherwise the writer is spawned and
    /// target determination begins once its file is open.
    #[instrument(skip_all, fields(guid = %self.guid, state = %self.state))]
    pub fn start(
        &mut self,
        writer: Option<DestinationWriter>,
        request: Option<Box<dyn RequestHandle>>,
        info: DownloadCreateInfo,
    ) {
        self.request = request;
        self.destination_error = None;

        if self.state == DownloadState::Cancelled {
            debug!("request started after cancellation, discarding");
            drop(writer);
            self.cancel_request();
            return;
        }
        if !matches!(
            self.state,
            DownloadState::Initial | DownloadState::Resuming
        ) {
            warn!("start called outside Initial/Resuming, ignoring");
            drop(writer);
            self.cancel_request();
            return;
        }

        let mut result = info.result;
        if result.is_none() && writer.is_none() {
            warn!("start without a writer");
            result = Some(InterruptReason::FileFailed);
        }
        if result.is_none()
            && self.state == DownloadState::Resuming
            && self.config.origin_change_policy == OriginChangePolicy::Restart
            && self.received_bytes > 0
            && self.validators_differ(&info)
        {
            info!("validators changed, discarding partial data");
            result = Some(InterruptReason::ServerNoRange);
        }

        if let Some(reason) = result {
            drop(writer);
            let hash_state = info.hash_state.clone();
            if self.target_path.as_os_str().is_empty() {
                self.received_bytes = info.offset;
                self.hash_state = hash_state;
                self.hash = None;
                self.destination_error = Some(reason);
                self.transition_to(DownloadState::InterruptedTargetPending);
                self.determine_target();
                return;
            }
            self.transition_to(DownloadState::TargetResolved);
            self.interrupt_with_partial_state(info.offset, hash_state, reason);
            self.update_observers();
            return;
        }

        let Some(writer) = writer else {
            return;
        };
        if self.state == DownloadState::Resuming {
            self.update_validators_on_resumption(&info);
        }
        if info.total_bytes > 0 {
            self.total_bytes = info.total_bytes;
        }
        if info.mime_type.is_some() {
            self.mime_type.clone_from(&info.mime_type);
        }
        if info.remote_address.is_some() {
            self.remote_address.clone_from(&info.remote_address);
        }

        self.transition_to(DownloadState::TargetPending);
        let writer = writer.with_config(self.config.writer_config());
        self.writer = Some(writer.spawn(Arc::new(self.sink())));
    }

    fn validators_differ(&self, info: &DownloadCreateInfo) -> bool {
        self.etag != info.etag || self.last_modified != info.last_modified
    }

    fn update_validators_on_resumption(&mut self, info: &DownloadCreateInfo) {
        let mut new_urls = info.url_chain.as_slice();
        if new_urls.first() == self.url_chain.last() {
            new_urls = &new_urls[1..];
        }
        self.events.record(ItemEvent::OriginChanged {
            additional_redirects: !new_urls.is_empty(),
            validators_changed: self.validators_differ(info),
            content_disposition_changed: self.content_disposition != info.content_disposition,
        });
        self.url_chain.extend(new_urls.iter().cloned());
        self.etag.clone_from(&info.etag);
        self.last_modified.clone_from(&info.last_modified);
        self.content_disposition.clone_from(&info.content_disposition);
    }

    // ==================== Writer events ====================

    fn on_writer_event(&mut self, event: WriterEvent) {
        match event {
            WriterEvent::Initialized(result) => self.on_file_initialized(result),
            WriterEvent::Renamed {
                kind: RenameKind::Uniquify,
                result,
                retries,
            } => self.on_renamed_to_intermediate(result, retries),
            WriterEvent::Renamed {
                kind: RenameKind::Annotate,
                result,
                retries,
            } => self.on_renamed_to_final(result, retries),
            event if !matches!(
                self.state,
                DownloadState::TargetPending | DownloadState::InProgress
            ) =>
            {
                debug!(?event, state = %self.state, "writer event outside active state");
            }
            WriterEvent::Update {
                received_bytes,
                bytes_per_sec,
            } => {
                self.update_progress(received_bytes, bytes_per_sec);
                self.update_observers();
            }
            WriterEvent::Error {
                reason,
                received_bytes,
                hash_state,
            } => self.on_destination_error(reason, received_bytes, hash_state),
            WriterEvent::Completed {
                total_bytes,
                hash_state,
            } => {
                self.on_all_data_saved(total_bytes, hash_state);
                self.maybe_complete_download();
            }
        }
    }

    fn on_file_initialized(&mut self, result: Result<(), InterruptReason>) {
        if self.state != DownloadState::TargetPending {
            debug!(state = %self.state, "file initialized outside TargetPending");
            return;
        }
        if let Err(reason) = result {
            self.received_bytes = 0;
            self.hash_state = None;
            self.hash = None;
            self.destination_error = Some(reason);
            if self.config.hold_on_local_corruption && reason.kind() == ErrorKind::Integrity {
                info!(%reason, "partial file failed verification, holding for user");
                self.integrity_hold = true;
            }
            self.transition_to(DownloadState::InterruptedTargetPending);
        }
        self.determine_target();
    }

    fn on_destination_error(
        &mut self,
        reason: InterruptReason,
        received_bytes: u64,
        hash_state: HashState,
    ) {
        // Wait for the intermediate rename before acting on the error.
        if self.state == DownloadState::TargetPending {
            self.received_bytes = received_bytes;
            self.hash_state = Some(hash_state);
            self.hash = None;
            self.destination_error = Some(reason);
            return;
        }
        self.interrupt_with_partial_state(received_bytes, Some(hash_state), reason);
        self.update_observers();
    }

    fn on_all_data_saved(&mut self, total_bytes: u64, hash_state: HashState) {
        self.all_data_saved = true;
        self.total_bytes = total_bytes;
        self.update_progress(total_bytes, 0);
        self.set_hash_state(Some(hash_state));
        self.hash_state = None;
        self.update_observers();
    }

    // ==================== Target determination ====================

    fn determine_target(&mut self) {
        let callback = TargetCallback::new(self.sink());
        let delegate = Arc::clone(&self.delegate);
        delegate.determine_target(self, callback);
    }

    fn on_target_determined(&mut self, target: DownloadTarget) {
        if !matches!(
            self.state,
            DownloadState::TargetPending | DownloadState::InterruptedTargetPending
        ) {
            debug!(state = %self.state, "target arrived outside target determination");
            return;
        }
        if target.is_cancelled() {
            self.cancel(true);
            return;
        }

        debug!(
            target = %target.target_path.display(),
            intermediate = %target.intermediate_path.display(),
            "target determined"
        );
        self.target_path = target.target_path;
        self.target_disposition = target.disposition;
        self.set_danger_type(target.danger_type);

        if self.state == DownloadState::InterruptedTargetPending {
            let reason = self
                .destination_error
                .take()
                .unwrap_or(InterruptReason::FileFailed);
            let hash_state = self.hash_state.take();
            self.interrupt_with_partial_state(self.received_bytes, hash_state, reason);
            self.update_observers();
            return;
        }

        if non_empty(&self.current_path) == Some(target.intermediate_path.as_path()) {
            self.on_renamed_to_intermediate(Ok(target.intermediate_path), 0);
            return;
        }
        match &self.writer {
            Some(writer) => writer.rename_and_uniquify(target.intermediate_path),
            None => self.on_renamed_to_intermediate(Err(InterruptReason::FileFailed), 0),
        }
    }

    fn on_renamed_to_intermediate(&mut self, result: Result<PathBuf, InterruptReason>, retries: u32) {
        if self.state != DownloadState::TargetPending {
            debug!(state = %self.state, "intermediate rename outside TargetPending");
            return;
        }
        self.transition_to(DownloadState::TargetResolved);

        // A failed rename outranks a pending destination error.
        let path = match result {
            Ok(path) => path,
            Err(reason) => {
                self.interrupt_and_discard_partial_state(reason);
                self.update_observers();
                return;
            }
        };
        self.set_full_path(path, retries);

        if let Some(reason) = self.destination_error.take() {
            let hash_state = self.hash_state.take();
            self.interrupt_with_partial_state(self.received_bytes, hash_state, reason);
            self.update_observers();
            return;
        }

        self.transition_to(DownloadState::InProgress);
        self.update_observers();
        self.maybe_complete_download();
    }

    // ==================== Completion cascade ====================

    fn is_ready_for_completion(&mut self) -> bool {
        if self.state != DownloadState::InProgress || !self.all_data_saved || self.is_dangerous() {
            return false;
        }
        let callback = CompletionCallback::new(self.sink());
        let delegate = Arc::clone(&self.delegate);
        delegate.should_complete_download(self, callback)
    }

    fn maybe_complete_download(&mut self) {
        if !self.is_ready_for_completion() {
            return;
        }
        debug!(target = %self.target_path.display(), "completing download");
        match &self.writer {
            Some(writer) => writer.rename_and_annotate(self.target_path.clone()),
            None => {
                self.interrupt_and_discard_partial_state(InterruptReason::FileFailed);
                self.update_observers();
            }
        }
    }

    fn on_renamed_to_final(&mut self, result: Result<PathBuf, InterruptReason>, retries: u32) {
        if self.state != DownloadState::InProgress {
            debug!(state = %self.state, "final rename outside InProgress");
            return;
        }
        let path = match result {
            Ok(path) => path,
            Err(reason) => {
                self.interrupt_and_discard_partial_state(reason);
                self.update_observers();
                return;
            }
        };
        if path != self.current_path {
            self.set_full_path(path, retries);
        }

        self.release_writer(false);
        self.transition_to(DownloadState::Completing);

        let callback = OpenCallback::new(self.sink());
        let delegate = Arc::clone(&self.delegate);
        if delegate.should_open_download(self, callback) {
            self.completed();
        } else {
            self.delayed_complete = true;
            self.update_observers();
        }
    }

    fn on_delayed_open(&mut self, auto_opened: bool) {
        if self.state != DownloadState::Completing {
            return;
        }
        self.auto_opened = auto_opened;
        self.completed();
    }

    fn completed(&mut self) {
        self.end_time = Some(SystemTime::now());
        self.delayed_complete = false;
        self.transition_to(DownloadState::Complete);
        self.events.record(ItemEvent::Completed {
            total_bytes: self.received_bytes,
        });

        if !self.auto_opened && (self.open_when_complete || self.is_temporary) {
            if !self.is_temporary {
                self.open_download();
            }
            self.auto_opened = true;
        }
        self.update_observers();
    }

    // ==================== Interruption ====================

    fn interrupt_and_discard_partial_state(&mut self, reason: InterruptReason) {
        self.interrupt_with_partial_state(0, None, reason);
    }

    fn interrupt_with_partial_state(
        &mut self,
        bytes_so_far: u64,
        hash_state: Option<HashState>,
        reason: InterruptReason,
    ) {
        match self.state {
            DownloadState::Cancelled | DownloadState::Completing | DownloadState::Complete => {
                return;
            }
            DownloadState::Initial => {
                if !reason.is_cancellation() {
                    warn!(%reason, "interrupt before start ignored");
                    return;
                }
                self.last_reason = Some(reason);
            }
            DownloadState::InterruptedTargetPending
            | DownloadState::TargetPending
            | DownloadState::TargetResolved
            | DownloadState::InProgress => {
                self.last_reason = Some(reason);
                if self.writer.is_some() {
                    let keep = self.resume_mode().keeps_partial_file();
                    self.release_writer(!keep);
                }
            }
            DownloadState::Resuming | DownloadState::Interrupted => {
                // The first non-cancel reason wins.
                if !reason.is_cancellation() {
                    return;
                }
                self.last_reason = Some(reason);
                if !self.current_path.as_os_str().is_empty() {
                    delete_file_in_background(std::mem::take(&mut self.current_path));
                }
            }
        }

        self.all_data_saved = false;
        if self.current_path.as_os_str().is_empty() {
            self.hash_state = None;
            self.hash = None;
            self.received_bytes = 0;
        } else {
            // A restored item carries only the prefix digest; keep it while
            // the offset it covers is unchanged.
            let keep_digest = hash_state.is_none() && bytes_so_far == self.received_bytes;
            self.update_progress(bytes_so_far, 0);
            if !keep_digest {
                self.set_hash_state(hash_state);
            }
        }

        self.cancel_request();

        if reason.is_cancellation() {
            if self.is_dangerous() {
                let cause = if reason == InterruptReason::UserCanceled {
                    DiscardCause::UserCancel
                } else {
                    DiscardCause::Shutdown
                };
                self.events.record(ItemEvent::DangerousDiscarded {
                    cause,
                    danger: self.danger_type,
                });
            }
            self.transition_to(DownloadState::Cancelled);
            return;
        }

        self.events.record(ItemEvent::Interrupted {
            reason,
            received_bytes: self.received_bytes,
        });
        self.transition_to(DownloadState::Interrupted);
        self.auto_resume_if_valid();
    }

    fn release_writer(&mut self, destroy: bool) {
        if let Some(writer) = self.writer.take() {
            if destroy {
                writer.cancel();
                self.current_path.clear();
            } else {
                writer.detach();
            }
        }
        self.generation += 1;
    }

    fn cancel_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.cancel();
        }
    }

    // ==================== Resumption ====================

    /// How an interruption would be resumed right now.
    #[must_use]
    pub fn resume_mode(&self) -> ResumeMode {
        let context = ResumeContext {
            http_scheme: self.has_http_url(),
            has_intermediate_file: !self.current_path.as_os_str().is_empty(),
            has_validators: self.etag.as_deref().is_some_and(|v| !v.is_empty())
                || self.last_modified.as_deref().is_some_and(|v| !v.is_empty()),
            auto_resume_exhausted: self.auto_resume_count >= self.config.max_auto_resume_attempts,
            paused: self.paused,
            integrity_hold: self.integrity_hold,
        };
        resume_mode(self.last_reason, &context)
    }

    fn has_http_url(&self) -> bool {
        Url::parse(self.url())
            .is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    fn auto_resume_if_valid(&mut self) {
        let mode = self.resume_mode();
        if !mode.is_immediate() {
            debug!(?mode, "not resuming automatically");
            return;
        }
        self.auto_resume_count += 1;

        let delay = self
            .config
            .auto_resume_backoff
            .backoff_delay(self.auto_resume_count);
        if delay.is_zero() {
            self.resume_interrupted_download(ResumeOrigin::Automatic);
            return;
        }
        debug!(
            attempt = self.auto_resume_count,
            delay_ms = delay.as_millis(),
            "scheduling automatic resumption"
        );
        let sink = self.sink();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.post(ControlEvent::AutoResumeDue { generation });
        });
    }

    fn resume_interrupted_download(&mut self, origin: ResumeOrigin) {
        if self.state != DownloadState::Interrupted {
            return;
        }
        // Anything still in flight belongs to the previous attempt.
        self.generation += 1;

        let mode = self.resume_mode();
        if mode.is_restart() {
            self.received_bytes = 0;
            self.last_modified = None;
            self.etag = None;
            self.hash = None;
            self.hash_state = None;
        }

        let params = ResumeParameters {
            url: self.url().to_string(),
            referrer: self.referrer.clone(),
            file_path: non_empty(&self.current_path).map(Path::to_path_buf),
            offset: self.received_bytes,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            hash_of_partial_file: self.hash,
            hash_state: self.hash_state.clone(),
            guid: self.guid.clone(),
        };

        self.transition_to(DownloadState::Resuming);
        self.events.record(ItemEvent::Resumed { origin, mode });
        let callback = ResumptionCallback::new(self.sink());
        self.delegate
            .resume_interrupted_download(params, self.id, callback);
        self.paused = false;
    }

    // ==================== Public operations ====================

    /// Pauses the request while data is flowing. No-op elsewhere.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        if matches!(
            self.state,
            DownloadState::TargetPending | DownloadState::InProgress
        ) {
            if let Some(request) = &self.request {
                request.pause();
            }
            self.paused = true;
            self.update_observers();
        }
    }

    /// Unpauses a paused request, or resumes an interrupted download.
    #[instrument(skip(self), fields(guid = %self.guid, state = %self.state))]
    pub fn resume(&mut self) {
        match self.state {
            DownloadState::TargetPending | DownloadState::InProgress => {
                if !self.paused {
                    return;
                }
                if let Some(request) = &self.request {
                    request.resume();
                }
                self.paused = false;
                self.update_observers();
            }
            DownloadState::Interrupted => {
                self.auto_resume_count = 0;
                self.integrity_hold = false;
                self.resume_interrupted_download(ResumeOrigin::User);
                self.update_observers();
            }
            _ => {}
        }
    }

    /// Cancels the download and deletes its intermediate file.
    ///
    /// `user_initiated` distinguishes a user cancel from shutdown.
    #[instrument(skip(self), fields(guid = %self.guid, state = %self.state))]
    pub fn cancel(&mut self, user_initiated: bool) {
        let reason = if user_initiated {
            InterruptReason::UserCanceled
        } else {
            InterruptReason::UserShutdown
        };
        self.interrupt_and_discard_partial_state(reason);
        self.update_observers();
    }

    /// Cancels the download and tells observers and the delegate it is gone.
    pub fn remove(&mut self) {
        self.interrupt_and_discard_partial_state(InterruptReason::UserCanceled);
        self.update_observers();
        for observer in self.observers.snapshot() {
            observer.on_removed(self);
        }
        let delegate = Arc::clone(&self.delegate);
        delegate.download_removed(self);
    }

    /// Marks a dangerous download as accepted and lets it complete.
    pub fn validate_dangerous_download(&mut self) {
        if self.is_done() || !self.is_dangerous() {
            return;
        }
        info!(guid = %self.guid, danger = ?self.danger_type, "dangerous download validated");
        self.danger_type = DangerType::UserValidated;
        self.update_observers();
        self.maybe_complete_download();
    }

    /// Hands the file over to `callback` instead of completing, then removes
    /// the item. The file is kept on disk.
    pub fn steal_dangerous_download(&mut self, callback: DetachCallback) {
        if !self.is_dangerous() {
            warn!(guid = %self.guid, "stealing a download that is not dangerous");
        }
        match self.writer.take() {
            Some(writer) => writer.detach_then(callback),
            None => callback(non_empty(&self.current_path).map(Path::to_path_buf)),
        }
        self.generation += 1;
        self.current_path.clear();
        self.remove();
    }

    /// Opens a completed download, or toggles open-when-complete otherwise.
    pub fn open_download(&mut self) {
        if !self.is_done() {
            if !self.is_temporary {
                self.open_when_complete = !self.open_when_complete;
            }
            return;
        }
        if self.state != DownloadState::Complete || self.file_externally_removed {
            return;
        }
        self.opened = true;
        for observer in self.observers.snapshot() {
            observer.on_opened(self);
        }
        let delegate = Arc::clone(&self.delegate);
        delegate.open_download(self);
    }

    pub fn set_open_when_complete(&mut self, open: bool) {
        self.open_when_complete = open;
    }

    pub fn set_is_temporary(&mut self, temporary: bool) {
        self.is_temporary = temporary;
    }

    pub fn set_opened(&mut self, opened: bool) {
        self.opened = opened;
    }

    /// Records that the completed file was deleted outside the engine.
    pub fn on_downloaded_file_removed(&mut self) {
        self.file_externally_removed = true;
        self.update_observers();
    }

    pub fn add_observer(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Handle to the observer list, usable from inside observer callbacks.
    #[must_use]
    pub fn observers(&self) -> ObserverRegistry {
        self.observers.clone()
    }

    // ==================== Queries ====================

    #[must_use]
    pub fn is_done(&self) -> bool {
        match self.state {
            DownloadState::Complete | DownloadState::Cancelled => true,
            DownloadState::Interrupted => !self.can_resume(),
            _ => false,
        }
    }

    #[must_use]
    pub fn can_resume(&self) -> bool {
        match self.state {
            DownloadState::TargetPending
            | DownloadState::TargetResolved
            | DownloadState::InProgress => self.paused,
            // An immediate mode is resumable too: its resumption may still be
            // waiting out the backoff delay.
            DownloadState::Interrupted => self.resume_mode() != ResumeMode::Invalid,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_dangerous(&self) -> bool {
        self.danger_type.is_dangerous()
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The most recent URL in the redirect chain.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url_chain.last().map_or("", String::as_str)
    }

    #[must_use]
    pub fn original_url(&self) -> &str {
        self.url_chain.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn url_chain(&self) -> &[String] {
        &self.url_chain
    }

    #[must_use]
    pub fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    #[must_use]
    pub fn content_disposition(&self) -> Option<&str> {
        self.content_disposition.as_deref()
    }

    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    #[must_use]
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    #[must_use]
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    #[must_use]
    pub fn target_disposition(&self) -> TargetDisposition {
        self.target_disposition
    }

    /// Where the data currently lives; empty when no file exists.
    #[must_use]
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Announced size, or 0 when unknown.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Digest of the saved data: the full content once complete.
    #[must_use]
    pub fn hash(&self) -> Option<ContentHash> {
        self.hash
    }

    #[must_use]
    pub fn hash_state(&self) -> Option<&HashState> {
        self.hash_state.as_ref()
    }

    #[must_use]
    pub fn danger_type(&self) -> DangerType {
        self.danger_type
    }

    #[must_use]
    pub fn last_reason(&self) -> Option<InterruptReason> {
        self.last_reason
    }

    #[must_use]
    pub fn state(&self) -> DownloadState {
        self.state
    }

    #[must_use]
    pub fn external_state(&self) -> ExternalState {
        self.state.external()
    }

    #[must_use]
    pub fn auto_resume_count(&self) -> u32 {
        self.auto_resume_count
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn all_data_saved(&self) -> bool {
        self.all_data_saved
    }

    /// Waiting for the user after the partial file failed verification.
    #[must_use]
    pub fn integrity_hold(&self) -> bool {
        self.integrity_hold
    }

    #[must_use]
    pub fn opened(&self) -> bool {
        self.opened
    }

    #[must_use]
    pub fn auto_opened(&self) -> bool {
        self.auto_opened
    }

    #[must_use]
    pub fn open_when_complete(&self) -> bool {
        self.open_when_complete
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    #[must_use]
    pub fn file_externally_removed(&self) -> bool {
        self.file_externally_removed
    }

    /// Completion is waiting on a delayed open.
    #[must_use]
    pub fn delayed_complete(&self) -> bool {
        self.delayed_complete
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    #[must_use]
    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    #[must_use]
    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Persistence ====================

    /// Snapshot of the fields that survive a restart.
    #[must_use]
    pub fn to_record(&self) -> DownloadRecord {
        DownloadRecord {
            guid: self.guid.clone(),
            url_chain: self.url_chain.clone(),
            referrer: self.referrer.clone(),
            site_url: self.site_url.clone(),
            tab_url: self.tab_url.clone(),
            tab_referrer_url: self.tab_referrer_url.clone(),
            mime_type: self.mime_type.clone(),
            original_mime_type: self.original_mime_type.clone(),
            current_path: self.current_path.clone(),
            target_path: self.target_path.clone(),
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            hash: self.hash.map(|hash| hash.to_hex()),
            danger_type: self.danger_type,
            state: self.state.external(),
            interrupt_reason: self.last_reason,
            opened: self.opened,
            start_time: to_epoch_secs(self.start_time),
            end_time: self.end_time.map(to_epoch_secs),
        }
    }

    /// Rebuilds an item from a persisted record.
    ///
    /// A record saved while in progress comes back `Interrupted` with reason
    /// `Crash`, ready for [`DownloadItem::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the record fails validation.
    pub fn from_record(
        id: u32,
        record: DownloadRecord,
        delegate: Arc<dyn DownloadDelegate>,
        config: EngineConfig,
    ) -> Result<Self, RecordError> {
        record.validate()?;
        let hash = record.parsed_hash()?;
        let info = DownloadCreateInfo {
            url_chain: record.url_chain,
            referrer: record.referrer,
            site_url: record.site_url,
            tab_url: record.tab_url,
            tab_referrer_url: record.tab_referrer_url,
            etag: record.etag,
            last_modified: record.last_modified,
            mime_type: record.mime_type,
            original_mime_type: record.original_mime_type,
            total_bytes: record.total_bytes,
            guid: Some(record.guid),
            ..DownloadCreateInfo::default()
        };
        let mut item = Self::new(id, &info, delegate, config);

        let (state, reason) = match record.state {
            ExternalState::Complete => (DownloadState::Complete, record.interrupt_reason),
            ExternalState::Cancelled => (DownloadState::Cancelled, record.interrupt_reason),
            ExternalState::Interrupted => (
                DownloadState::Interrupted,
                Some(record.interrupt_reason.unwrap_or(InterruptReason::Crash)),
            ),
            ExternalState::InProgress => (DownloadState::Interrupted, Some(InterruptReason::Crash)),
        };
        item.state = state;
        item.last_reason = reason;
        item.current_path = record.current_path;
        item.target_path = record.target_path;
        item.received_bytes = record.received_bytes;
        item.hash = hash;
        item.all_data_saved = state == DownloadState::Complete;
        item.danger_type = record.danger_type;
        item.opened = record.opened;
        item.start_time = from_epoch_secs(record.start_time);
        item.end_time = record.end_time.map(from_epoch_secs);
        debug!(guid = %item.guid, state = %item.state, "restored download");
        Ok(item)
    }

    // ==================== Helpers ====================

    fn transition_to(&mut self, next: DownloadState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                guid = %self.guid,
                from = %self.state,
                to = %next,
                "illegal state transition ignored"
            );
            return false;
        }
        let from = self.state;
        self.state = next;
        self.events.record(ItemEvent::StateChanged { from, to: next });
        true
    }

    fn set_full_path(&mut self, path: PathBuf, retries: u32) {
        self.events.record(ItemEvent::Renamed {
            to: path.clone(),
            retries,
        });
        self.current_path = path;
    }

    fn set_danger_type(&mut self, danger_type: DangerType) {
        if danger_type != self.danger_type {
            debug!(from = ?self.danger_type, to = ?danger_type, "danger type changed");
        }
        self.danger_type = danger_type;
    }

    fn update_progress(&mut self, bytes_so_far: u64, bytes_per_sec: u64) {
        self.received_bytes = bytes_so_far;
        self.bytes_per_sec = bytes_per_sec;
        // More data than announced: the size was wrong, forget it.
        if self.total_bytes > 0 && self.received_bytes > self.total_bytes {
            self.total_bytes = 0;
        }
    }

    fn set_hash_state(&mut self, hash_state: Option<HashState>) {
        self.hash = hash_state.as_ref().map(HashState::finish);
        self.hash_state = hash_state;
    }

    fn update_observers(&self) {
        for observer in self.observers.snapshot() {
            observer.on_updated(self);
        }
    }
}

impl Drop for DownloadItem {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.detach();
        }
        for observer in self.observers.snapshot() {
            observer.on_destroyed(self);
        }
    }
}

fn delete_file_in_background(path: PathBuf) {
    debug!(path = %path.display(), "deleting intermediate file");
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(error) = tokio::fs::remove_file(&path).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %error, "failed to delete file");
                }
            });
        }
        Err(_) => {
            if let Err(error) = std::fs::remove_file(&path)
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %error, "failed to delete file");
            }
        }
    }
}
