//! Resumable download engine.
//!
//! This module persists an in-flight byte stream to disk, hashes it as it
//! goes, and recovers from interruptions by resuming from a verified offset.
//!
//! # Layers
//!
//! - [`FileHandle`] owns one file: open at an offset, verify the prefix hash,
//!   append, rename, delete.
//! - [`DestinationWriter`] runs as its own task, draining a
//!   [`ByteStreamReader`] into a `FileHandle` and reporting progress.
//! - [`DownloadItem`] owns the lifecycle: target determination, state
//!   transitions, interruption classification and resumption.
//! - [`HttpClient`] and [`DirectoryDelegate`] connect the engine to HTTP and
//!   to a download directory.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use resumable_downloader_core::download::{
//!     DirectoryDelegate, DownloadItem, DownloadRequest, DownloadState, EngineConfig, HttpClient,
//!     RequestHandle,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let delegate = Arc::new(DirectoryDelegate::new("./downloads", client.clone()));
//! let request = DownloadRequest::new("https://example.com/paper.pdf");
//!
//! let (writer, handle, info) = match client.start(request).await {
//!     Ok(started) => (Some(started.writer), Some(started.request), started.info),
//!     Err(failure) => (None, None, failure.info),
//! };
//! let mut item = DownloadItem::new(1, &info, delegate, EngineConfig::default());
//! item.start(writer, handle.map(|h| Box::new(h) as Box<dyn RequestHandle>), info);
//! // Stop once finished or waiting for the user.
//! item.run_until(|item| {
//!     item.is_done()
//!         || (item.state() == DownloadState::Interrupted && !item.resume_mode().is_immediate())
//! })
//! .await;
//! println!("{}: {}", item.state(), item.current_path().display());
//! # Ok(())
//! # }
//! ```

mod config;
mod constants;
mod control;
mod delegate;
mod directory_delegate;
mod error;
mod event_log;
mod file;
mod filename;
mod hash;
mod http;
mod interrupt;
mod item;
mod rate;
mod record;
mod resume;
mod retry;
mod state;
mod stream;
mod writer;

pub use config::{EngineConfig, OriginChangePolicy};
pub use constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_STREAM_CAPACITY, MAX_AUTO_RESUME_ATTEMPTS,
    PROGRESS_UPDATE_INTERVAL, READ_TIMEOUT_SECS,
};
pub use delegate::{
    CompletionCallback, DangerType, DownloadCreateInfo, DownloadDelegate, DownloadObserver,
    DownloadTarget, OpenCallback, RequestHandle, ResumeParameters, ResumptionCallback,
    TargetCallback, TargetDisposition,
};
pub use directory_delegate::DirectoryDelegate;
pub use error::{ConfigError, FileError, RecordError, RequestError};
pub use event_log::{DiscardCause, EventLog, ItemEvent, LoggedEvent, ResumeOrigin};
pub use file::{FileHandle, FileInit};
pub use filename::{
    filename_for_download, intermediate_path_for, resolve_unique_path, uniquified_path,
};
pub use hash::{ContentHash, HashState};
pub use http::{DownloadRequest, HttpClient, HttpRequestHandle, RequestFailure, StartedRequest};
pub use interrupt::{ErrorKind, InterruptReason, ReasonPolicy};
pub use item::{DownloadItem, ObserverId, ObserverRegistry};
pub use rate::RateEstimator;
pub use record::DownloadRecord;
pub use resume::{ResumeContext, ResumeMode, resume_mode};
pub use retry::{RetryDecision, RetryPolicy, retry_file_operation};
pub use state::{DownloadState, ExternalState};
pub use stream::{
    ByteStreamPipe, ByteStreamReader, ByteStreamWriter, DataAvailableCallback, PipeClosed,
    StreamRead, byte_stream,
};
pub use writer::{
    DestinationWriter, DetachCallback, RenameKind, WriterConfig, WriterEvent, WriterHandle,
    WriterObserver, WriterParams,
};

// Note: no module-local Result aliases. Use `Result<T, FileError>` and
// friends explicitly in signatures.
