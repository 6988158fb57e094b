//! Byte-stream source consumed by destination writers.
//!
//! # Overview
//!
//! A [`ByteStreamReader`] is polled, not awaited: [`ByteStreamReader::read`]
//! returns whatever is buffered right now, and a registered callback fires
//! whenever more data (or completion) becomes available.
//!
//! [`byte_stream`] builds an in-process pipe: the network side pushes chunks
//! through a [`ByteStreamWriter`] (with bounded backpressure) and the
//! destination writer drains the [`ByteStreamPipe`].
//!
//! # Example
//!
//! ```
//! use resumable_downloader_core::download::{ByteStreamReader, StreamRead, byte_stream};
//!
//! # async fn example() {
//! let (writer, mut reader) = byte_stream(8);
//! writer.write(bytes::Bytes::from_static(b"hello")).await.ok();
//! writer.close(Ok(()));
//!
//! assert!(matches!(reader.read(), StreamRead::Data(_)));
//! assert!(matches!(reader.read(), StreamRead::Complete(Ok(()))));
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

use super::interrupt::InterruptReason;

/// Callback fired when a stream has something new to read.
pub type DataAvailableCallback = Arc<dyn Fn() + Send + Sync>;

/// Result of one non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// Nothing buffered; wait for the callback.
    Empty,
    /// One chunk of data.
    Data(Bytes),
    /// The source finished, successfully or with the reason it failed.
    Complete(Result<(), InterruptReason>),
}

/// A pollable byte source.
pub trait ByteStreamReader: Send {
    /// Returns the next buffered chunk, `Empty`, or the completion status.
    fn read(&mut self) -> StreamRead;

    /// Registers the data-available callback.
    ///
    /// Passing `None` silences the source permanently: later registrations
    /// are ignored and no callback fires again.
    fn register_callback(&mut self, callback: Option<DataAvailableCallback>);
}

#[derive(Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    completion: Option<Result<(), InterruptReason>>,
    callback: Option<DataAvailableCallback>,
    silenced: bool,
    reader_closed: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    capacity: Arc<Semaphore>,
}

impl PipeShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let callback = self.lock().callback.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// The consuming end of a [`byte_stream`] pipe.
pub struct ByteStreamPipe {
    shared: Arc<PipeShared>,
}

/// The producing end of a [`byte_stream`] pipe.
pub struct ByteStreamWriter {
    shared: Arc<PipeShared>,
    closed: bool,
}

/// The reading side went away; no more data will be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeClosed;

/// Creates a pipe that buffers at most `capacity` chunks.
#[must_use]
pub fn byte_stream(capacity: usize) -> (ByteStreamWriter, ByteStreamPipe) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState::default()),
        capacity: Arc::new(Semaphore::new(capacity.max(1))),
    });
    (
        ByteStreamWriter {
            shared: Arc::clone(&shared),
            closed: false,
        },
        ByteStreamPipe { shared },
    )
}

impl ByteStreamWriter {
    /// Queues one chunk, waiting while the pipe is full.
    ///
    /// # Errors
    ///
    /// Returns [`PipeClosed`] if the reader has been dropped.
    pub async fn write(&self, chunk: Bytes) -> Result<(), PipeClosed> {
        if chunk.is_empty() {
            return Ok(());
        }
        let permit = self
            .shared
            .capacity
            .acquire()
            .await
            .map_err(|_| PipeClosed)?;
        permit.forget();
        {
            let mut state = self.shared.lock();
            if state.reader_closed {
                return Err(PipeClosed);
            }
            state.chunks.push_back(chunk);
        }
        self.shared.notify();
        Ok(())
    }

    /// Marks the stream complete. Buffered chunks are still delivered first.
    pub fn close(mut self, status: Result<(), InterruptReason>) {
        self.finish(status);
    }

    fn finish(&mut self, status: Result<(), InterruptReason>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.lock().completion = Some(status);
        self.shared.notify();
    }
}

impl Drop for ByteStreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            debug!("byte stream writer dropped without close");
            self.finish(Err(InterruptReason::NetworkFailed));
        }
    }
}

impl ByteStreamReader for ByteStreamPipe {
    fn read(&mut self) -> StreamRead {
        let mut state = self.shared.lock();
        if let Some(chunk) = state.chunks.pop_front() {
            drop(state);
            self.shared.capacity.add_permits(1);
            return StreamRead::Data(chunk);
        }
        match state.completion {
            Some(status) => StreamRead::Complete(status),
            None => StreamRead::Empty,
        }
    }

    fn register_callback(&mut self, callback: Option<DataAvailableCallback>) {
        let mut state = self.shared.lock();
        if state.silenced {
            return;
        }
        match callback {
            Some(callback) => state.callback = Some(callback),
            None => {
                state.callback = None;
                state.silenced = true;
            }
        }
    }
}

impl Drop for ByteStreamPipe {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        state.callback = None;
        state.chunks.clear();
        drop(state);
        self.shared.capacity.close();
    }
}
