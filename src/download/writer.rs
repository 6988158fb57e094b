//! Destination writer: drains a byte stream into a [`FileHandle`].
//!
//! # Overview
//!
//! A [`DestinationWriter`] runs as its own tokio task (an actor). It owns the
//! file handle and the byte stream, and talks to its owner only through
//! messages:
//!
//! - events flow out through a [`WriterObserver`] ([`WriterEvent`])
//! - commands flow in through the [`WriterHandle`] returned by
//!   [`DestinationWriter::spawn`]
//!
//! The drain loop reads chunks until the stream is empty, completes, fails,
//! or the per-pass blocking budget runs out; an exhausted pass re-queues
//! itself behind any pending command. Progress is reported on a repeating
//! timer that starts with the first drain and stops once the stream ends.
//!
//! `Error` and `Completed` are emitted at most once per writer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use resumable_downloader_core::download::{
//!     DestinationWriter, FileInit, WriterEvent, WriterParams, byte_stream,
//! };
//! use tokio::sync::mpsc;
//!
//! # async fn example() {
//! let (network, pipe) = byte_stream(16);
//! let params = WriterParams {
//!     file: FileInit::default(),
//!     source_url: "https://example.com/a.bin".to_string(),
//!     referrer: None,
//! };
//! let (tx, mut events) = mpsc::unbounded_channel::<WriterEvent>();
//! let handle = DestinationWriter::new(params, Box::new(pipe)).spawn(Arc::new(tx));
//!
//! network.write(bytes::Bytes::from_static(b"payload")).await.ok();
//! network.close(Ok(()));
//! while let Some(event) = events.recv().await {
//!     if let WriterEvent::Completed { .. } = event {
//!         break;
//!     }
//! }
//! handle.detach();
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::constants::{MAX_DRAIN_BLOCKING_TIME, PROGRESS_UPDATE_INTERVAL};
use super::error::FileError;
use super::file::{FileHandle, FileInit};
use super::filename::resolve_unique_path;
use super::hash::HashState;
use super::interrupt::InterruptReason;
use super::rate::RateEstimator;
use super::retry::{RetryPolicy, retry_file_operation};
use super::stream::{ByteStreamReader, StreamRead};

/// Timing and retry settings for one writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    pub progress_interval: Duration,
    pub max_drain_blocking: Duration,
    pub rename_retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            progress_interval: PROGRESS_UPDATE_INTERVAL,
            max_drain_blocking: MAX_DRAIN_BLOCKING_TIME,
            rename_retry: RetryPolicy::rename_default(),
        }
    }
}

/// Which rename protocol produced a [`WriterEvent::Renamed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameKind {
    /// Move to the intermediate path, disambiguating collisions.
    Uniquify,
    /// Move to the final path and annotate with provenance.
    Annotate,
}

/// Messages from a writer to its owner.
#[derive(Debug, Clone)]
pub enum WriterEvent {
    /// File opened and verified, or the reason it could not be.
    Initialized(Result<(), InterruptReason>),
    /// Periodic progress.
    Update {
        received_bytes: u64,
        bytes_per_sec: u64,
    },
    /// The stream or the file failed; no more data will be written.
    Error {
        reason: InterruptReason,
        received_bytes: u64,
        hash_state: HashState,
    },
    /// Every byte of the stream is on disk.
    Completed {
        total_bytes: u64,
        hash_state: HashState,
    },
    /// Result of a rename command with the number of retries it took.
    Renamed {
        kind: RenameKind,
        result: Result<PathBuf, InterruptReason>,
        retries: u32,
    },
}

/// Receives writer events, from the writer's task.
pub trait WriterObserver: Send + Sync {
    fn on_writer_event(&self, event: WriterEvent);
}

impl WriterObserver for mpsc::UnboundedSender<WriterEvent> {
    fn on_writer_event(&self, event: WriterEvent) {
        // A dropped receiver means nobody cares anymore.
        let _ = self.send(event);
    }
}

/// Callback receiving the file path once a writer has detached.
pub type DetachCallback = Box<dyn FnOnce(Option<PathBuf>) + Send>;

enum WriterCommand {
    RenameAndUniquify(PathBuf),
    RenameAndAnnotate(PathBuf),
    Cancel,
    Detach(Option<DetachCallback>),
}

/// Parameters for opening the destination file.
#[derive(Debug, Clone)]
pub struct WriterParams {
    pub file: FileInit,
    /// Recorded as provenance on the final file.
    pub source_url: String,
    pub referrer: Option<String>,
}

/// A writer that has not been started yet.
pub struct DestinationWriter {
    params: WriterParams,
    stream: Box<dyn ByteStreamReader>,
    config: WriterConfig,
}

impl std::fmt::Debug for DestinationWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationWriter")
            .field("params", &self.params)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DestinationWriter {
    #[must_use]
    pub fn new(params: WriterParams, stream: Box<dyn ByteStreamReader>) -> Self {
        Self {
            params,
            stream,
            config: WriterConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: WriterConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn params(&self) -> &WriterParams {
        &self.params
    }

    /// Replaces the file parameters, e.g. to resume on top of known data.
    pub fn set_file_init(&mut self, file: FileInit) {
        self.params.file = file;
    }

    /// Starts the writer task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(self, observer: Arc<dyn WriterObserver>) -> WriterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = WriterTask {
            init_path: self.params.file.path.clone(),
            file: None,
            stream: self.stream,
            stream_done: false,
            observer,
            rate: RateEstimator::new(),
            source_url: self.params.source_url,
            referrer: self.params.referrer,
            config: self.config,
        };
        tokio::spawn(task.run(self.params.file, rx));
        WriterHandle { commands: tx }
    }
}

/// Command side of a running writer.
///
/// Dropping the handle without calling [`WriterHandle::detach`] cancels the
/// writer and deletes its file.
#[derive(Debug)]
pub struct WriterHandle {
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RenameAndUniquify(path) => f.debug_tuple("RenameAndUniquify").field(path).finish(),
            Self::RenameAndAnnotate(path) => f.debug_tuple("RenameAndAnnotate").field(path).finish(),
            Self::Cancel => f.write_str("Cancel"),
            Self::Detach(_) => f.write_str("Detach"),
        }
    }
}

impl WriterHandle {
    /// Moves the file to `path`, or `path (n)` when `path` is taken.
    pub fn rename_and_uniquify(&self, path: PathBuf) {
        self.send(WriterCommand::RenameAndUniquify(path));
    }

    /// Moves the file to exactly `path` and annotates it.
    pub fn rename_and_annotate(&self, path: PathBuf) {
        self.send(WriterCommand::RenameAndAnnotate(path));
    }

    /// Stops the writer and deletes its file.
    pub fn cancel(self) {
        self.send(WriterCommand::Cancel);
    }

    /// Stops the writer and keeps its file.
    pub fn detach(self) {
        self.send(WriterCommand::Detach(None));
    }

    /// Like [`WriterHandle::detach`], then hands the file path to `callback`
    /// from the writer's task.
    pub fn detach_then(self, callback: DetachCallback) {
        self.send(WriterCommand::Detach(Some(callback)));
    }

    fn send(&self, command: WriterCommand) {
        if let Err(error) = self.commands.send(command) {
            debug!(command = ?error.0, "writer task already stopped");
        }
    }
}

struct WriterTask {
    init_path: Option<PathBuf>,
    file: Option<FileHandle>,
    stream: Box<dyn ByteStreamReader>,
    stream_done: bool,
    observer: Arc<dyn WriterObserver>,
    rate: RateEstimator,
    source_url: String,
    referrer: Option<String>,
    config: WriterConfig,
}

impl WriterTask {
    async fn run(mut self, init: FileInit, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
        match FileHandle::initialize(init).await {
            Ok(file) => {
                self.init_path = Some(file.path().to_path_buf());
                self.file = Some(file);
                self.emit(WriterEvent::Initialized(Ok(())));
            }
            Err(error) => {
                warn!(error = %error, "destination file failed to initialize");
                self.stream_done = true;
                self.emit(WriterEvent::Initialized(Err(error.reason())));
            }
        }

        let data_ready = Arc::new(Notify::new());
        if !self.stream_done {
            let notify = Arc::clone(&data_ready);
            self.stream
                .register_callback(Some(Arc::new(move || notify.notify_one())));
            data_ready.notify_one();
        }

        let period = self.config.progress_interval;
        let mut progress = tokio::time::interval_at(Instant::now() + period, period);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timer_active = false;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(WriterCommand::RenameAndUniquify(path)) => {
                        self.rename(RenameKind::Uniquify, path).await;
                    }
                    Some(WriterCommand::RenameAndAnnotate(path)) => {
                        self.rename(RenameKind::Annotate, path).await;
                    }
                    Some(WriterCommand::Detach(callback)) => {
                        self.detach(callback);
                        break;
                    }
                    Some(WriterCommand::Cancel) | None => {
                        self.cancel().await;
                        break;
                    }
                },

                () = data_ready.notified(), if !self.stream_done => {
                    if self.drain().await {
                        data_ready.notify_one();
                    }
                    if !timer_active && !self.stream_done {
                        progress.reset();
                        timer_active = true;
                    }
                }

                _ = progress.tick(), if timer_active && !self.stream_done => {
                    self.send_update();
                }
            }
        }
    }

    fn emit(&self, event: WriterEvent) {
        self.observer.on_writer_event(event);
    }

    /// One drain pass. Returns `true` when the budget ran out with data
    /// possibly still buffered.
    async fn drain(&mut self) -> bool {
        let deadline = Instant::now() + self.config.max_drain_blocking;
        loop {
            match self.stream.read() {
                StreamRead::Empty => return false,
                StreamRead::Data(chunk) => {
                    let Some(file) = self.file.as_mut() else {
                        return false;
                    };
                    if let Err(error) = file.append_data_to_file(&chunk).await {
                        warn!(error = %error, "write to destination failed");
                        self.finish_stream(Err(error.reason())).await;
                        return false;
                    }
                    self.rate.record(chunk.len() as u64, Instant::now());
                }
                StreamRead::Complete(status) => {
                    self.finish_stream(status).await;
                    return false;
                }
            }
            if Instant::now() >= deadline {
                debug!("drain budget exhausted, yielding");
                return true;
            }
        }
    }

    async fn finish_stream(&mut self, status: Result<(), InterruptReason>) {
        self.stream.register_callback(None);
        self.stream_done = true;
        self.send_update();

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let received_bytes = file.bytes_so_far();
        let (status, hash_state) = match file.finish().await {
            Ok(hash_state) => (status, hash_state),
            Err(error) => {
                warn!(error = %error, "failed to flush destination file");
                (status.and(Err(error.reason())), file.hash_state())
            }
        };

        match status {
            Ok(()) => {
                info!(total_bytes = received_bytes, path = %file.path().display(), "all data saved");
                self.emit(WriterEvent::Completed {
                    total_bytes: received_bytes,
                    hash_state,
                });
            }
            Err(reason) => {
                debug!(%reason, received_bytes, "stream ended with error");
                self.emit(WriterEvent::Error {
                    reason,
                    received_bytes,
                    hash_state,
                });
            }
        }
    }

    fn send_update(&self) {
        let Some(file) = self.file.as_ref() else {
            return;
        };
        self.emit(WriterEvent::Update {
            received_bytes: file.bytes_so_far(),
            bytes_per_sec: self.rate.bytes_per_sec(Instant::now()),
        });
    }

    #[instrument(skip(self), fields(kind = ?kind))]
    async fn rename(&mut self, kind: RenameKind, requested: PathBuf) {
        let Some(file) = self.file.as_mut() else {
            self.emit(WriterEvent::Renamed {
                kind,
                result: Err(InterruptReason::FileFailed),
                retries: 0,
            });
            return;
        };

        let policy = self.config.rename_retry.clone();
        let (result, retries) = match kind {
            RenameKind::Uniquify => {
                retry_file_operation(&policy, file, |file| {
                    let requested = requested.clone();
                    async move {
                        let current = file.path().to_path_buf();
                        let target = resolve_unique_path(&requested, Some(&current)).ok_or_else(
                            || {
                                FileError::failed(
                                    InterruptReason::FileFailed,
                                    &requested,
                                    "no free name for intermediate file",
                                )
                            },
                        )?;
                        file.rename(&target).await?;
                        Ok(target)
                    }
                    .boxed()
                })
                .await
            }
            RenameKind::Annotate => {
                let source_url = self.source_url.clone();
                let referrer = self.referrer.clone();
                retry_file_operation(&policy, file, |file| {
                    let requested = requested.clone();
                    let source_url = source_url.clone();
                    let referrer = referrer.clone();
                    async move {
                        file.rename(&requested).await?;
                        file.annotate(&source_url, referrer.as_deref())?;
                        Ok(requested)
                    }
                    .boxed()
                })
                .await
            }
        };

        match &result {
            Ok(path) if retries > 0 => {
                info!(path = %path.display(), retries, "rename succeeded after retry");
            }
            Ok(path) => debug!(path = %path.display(), "renamed"),
            Err(error) => warn!(error = %error, retries, "rename failed"),
        }
        self.emit(WriterEvent::Renamed {
            kind,
            result: result.map_err(|e| e.reason()),
            retries,
        });
    }

    async fn cancel(&mut self) {
        self.stream.register_callback(None);
        match self.file.as_mut() {
            Some(file) => file.cancel().await,
            None => {
                if let Some(path) = &self.init_path
                    && let Err(error) = tokio::fs::remove_file(path).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %error, "failed to delete file");
                }
            }
        }
        debug!("writer cancelled");
    }

    fn detach(&mut self, callback: Option<DetachCallback>) {
        self.stream.register_callback(None);
        let path = match self.file.as_mut() {
            Some(file) => {
                file.detach();
                Some(file.path().to_path_buf())
            }
            None => self.init_path.clone(),
        };
        debug!(path = ?path, "writer detached");
        if let Some(callback) = callback {
            callback(path);
        }
    }
}
