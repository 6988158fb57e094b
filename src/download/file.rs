//! On-disk file ownership for one download.
//!
//! # Overview
//!
//! A [`FileHandle`] owns a single intermediate file: it opens (or creates)
//! it, verifies any partial data already on disk, appends new bytes while
//! keeping a running [`HashState`], and renames the file as the download
//! moves towards its final name.
//!
//! Dropping a handle deletes its file unless it was [detached](FileHandle::detach),
//! so an abandoned download never leaks a partial file.
//!
//! # Resuming
//!
//! When `bytes_so_far > 0` and no hash checkpoint is supplied, the first
//! `bytes_so_far` bytes are re-read with a bounded buffer and re-hashed. A
//! short read fails with `FileTooShort`; a digest that differs from the
//! supplied prefix hash fails with `FileHashMismatch`. Bytes past the
//! expected offset are truncated away.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::constants::REHASH_BUFFER_SIZE;
use super::error::FileError;
use super::hash::{ContentHash, HashState};
use super::interrupt::InterruptReason;

/// Everything needed to open a handle, possibly on top of partial data.
#[derive(Debug, Clone, Default)]
pub struct FileInit {
    /// Existing or desired file path; `None` creates a temporary file.
    pub path: Option<PathBuf>,
    /// Where temporary files go; the OS temp dir when `None`.
    pub default_dir: Option<PathBuf>,
    /// Bytes already saved by a previous attempt.
    pub bytes_so_far: u64,
    /// Digest of those bytes, compared after re-hashing.
    pub hash_of_partial_file: Option<ContentHash>,
    /// Live checkpoint covering those bytes; skips the re-hash when valid.
    pub hash_state: Option<HashState>,
}

/// Exclusive owner of one download's file on disk.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Option<File>,
    hash: HashState,
    bytes_so_far: u64,
    detached: bool,
    detached_appends: u64,
}

impl FileHandle {
    /// Opens the file described by `init`, verifying partial data.
    ///
    /// On failure the file is left on disk; the caller decides whether it
    /// is still useful.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the file cannot be created or opened, or if
    /// the partial data fails verification.
    #[instrument(skip(init), fields(path = ?init.path, bytes_so_far = init.bytes_so_far))]
    pub async fn initialize(init: FileInit) -> Result<Self, FileError> {
        let (path, file) = match init.path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await
                    .map_err(|e| FileError::io(&path, e))?;
                (path, file)
            }
            None => create_temporary(init.default_dir.as_deref()).await?,
        };

        let mut handle = Self {
            path,
            file: Some(file),
            hash: HashState::new(),
            bytes_so_far: init.bytes_so_far,
            detached: false,
            detached_appends: 0,
        };

        let result = handle
            .prepare(init.hash_state, init.hash_of_partial_file)
            .await;
        if let Err(error) = result {
            handle.detach();
            return Err(error);
        }
        debug!(path = %handle.path.display(), "file handle initialized");
        Ok(handle)
    }

    async fn prepare(
        &mut self,
        checkpoint: Option<HashState>,
        expected: Option<ContentHash>,
    ) -> Result<(), FileError> {
        let expected_bytes = self.bytes_so_far;
        match checkpoint {
            Some(state) if state.bytes_hashed() == expected_bytes => self.hash = state,
            _ => {
                self.hash = self.rehash_prefix(expected_bytes).await?;
                if let Some(expected) = expected
                    && self.hash.finish() != expected
                {
                    return Err(FileError::hash_mismatch(&self.path, expected_bytes));
                }
            }
        }

        let path = self.path.clone();
        let file = self.open_file()?;
        let len = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| FileError::io(&path, e))?;
        if len < expected_bytes {
            return Err(FileError::too_short(&path, expected_bytes));
        }
        if len > expected_bytes {
            debug!(len, expected_bytes, "truncating stale bytes past offset");
            file.set_len(expected_bytes)
                .await
                .map_err(|e| FileError::io(&path, e))?;
            file.seek(SeekFrom::Start(expected_bytes))
                .await
                .map_err(|e| FileError::io(&path, e))?;
        }
        Ok(())
    }

    async fn rehash_prefix(&mut self, expected_bytes: u64) -> Result<HashState, FileError> {
        let mut state = HashState::new();
        if expected_bytes == 0 {
            return Ok(state);
        }
        let path = self.path.clone();
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| FileError::io(&path, e))?;

        let mut buffer = vec![0u8; REHASH_BUFFER_SIZE];
        let mut remaining = expected_bytes;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
            let read = file
                .read(&mut buffer[..want])
                .await
                .map_err(|e| FileError::io(&path, e))?;
            if read == 0 {
                debug!(
                    read = expected_bytes - remaining,
                    expected_bytes, "partial file shorter than expected"
                );
                return Err(FileError::too_short(&path, expected_bytes));
            }
            state.update(&buffer[..read]);
            remaining -= read as u64;
        }
        Ok(state)
    }

    fn open_file(&mut self) -> Result<&mut File, FileError> {
        let path = &self.path;
        self.file
            .as_mut()
            .ok_or_else(|| FileError::failed(InterruptReason::FileFailed, path, "file is not open"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far
    }

    /// Whether the file is still open for writing.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.file.is_some()
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Appends issued after [`FileHandle::detach`].
    #[must_use]
    pub fn detached_appends(&self) -> u64 {
        self.detached_appends
    }

    /// Clone of the running hash.
    #[must_use]
    pub fn hash_state(&self) -> HashState {
        self.hash.clone()
    }

    /// Appends `data`, looping until every byte is written.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the file is closed or a write fails.
    pub async fn append_data_to_file(&mut self, data: &[u8]) -> Result<(), FileError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.detached {
            self.detached_appends += 1;
            warn!(
                path = %self.path.display(),
                count = self.detached_appends,
                "append through detached file handle"
            );
        }

        let path = self.path.clone();
        let file = self.open_file()?;
        let mut written = 0;
        while written < data.len() {
            let n = file
                .write(&data[written..])
                .await
                .map_err(|e| FileError::io(&path, e))?;
            if n == 0 {
                return Err(FileError::failed(
                    InterruptReason::FileFailed,
                    &path,
                    "write accepted zero bytes",
                ));
            }
            written += n;
        }

        self.hash.update(data);
        self.bytes_so_far += data.len() as u64;
        Ok(())
    }

    /// Moves the file to `new_path`, creating its directory if needed.
    ///
    /// A file that was open before the call is reopened afterwards (under
    /// the new name on success, the old name on failure).
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if the directory, move, or reopen fails.
    #[instrument(skip(self), fields(from = %self.path.display()))]
    pub async fn rename(&mut self, new_path: &Path) -> Result<(), FileError> {
        if new_path == self.path {
            return Ok(());
        }
        let was_in_progress = self.in_progress();
        self.close().await?;

        let moved = move_file(&self.path, new_path).await;
        if moved.is_ok() {
            self.path = new_path.to_path_buf();
        }
        if was_in_progress {
            self.reopen().await?;
        }
        moved
    }

    async fn reopen(&mut self) -> Result<(), FileError> {
        let mut file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(&self.path)
            .await
            .map_err(|e| FileError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.bytes_so_far))
            .await
            .map_err(|e| FileError::io(&self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    /// Hook for marking the completed file with its provenance.
    ///
    /// Provenance metadata is platform specific; this build records nothing.
    ///
    /// # Errors
    ///
    /// Never fails in this build.
    pub fn annotate(&self, source_url: &str, referrer: Option<&str>) -> Result<(), FileError> {
        debug!(path = %self.path.display(), source_url, ?referrer, "annotate");
        Ok(())
    }

    /// Closes the file and hands back the running hash.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] if buffered data cannot be flushed.
    pub async fn finish(&mut self) -> Result<HashState, FileError> {
        self.close().await?;
        Ok(std::mem::take(&mut self.hash))
    }

    async fn close(&mut self) -> Result<(), FileError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| FileError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Closes and deletes the file, then detaches.
    pub async fn cancel(&mut self) {
        if let Err(error) = self.close().await {
            debug!(error = %error, "flush failed while cancelling");
        }
        if let Err(error) = tokio::fs::remove_file(&self.path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %error, "failed to delete cancelled file");
        }
        self.detach();
    }

    /// Gives up ownership: the file survives this handle.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        self.file.take();
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %error, "failed to delete abandoned file");
        }
    }
}

async fn create_temporary(dir: Option<&Path>) -> Result<(PathBuf, File), FileError> {
    let dir = dir.map_or_else(std::env::temp_dir, Path::to_path_buf);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| FileError::io(&dir, e))?;
    let named = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| FileError::io(&dir, e))?;
    let (file, path) = named.keep().map_err(|e| FileError::io(&dir, e.error))?;
    Ok((path, File::from_std(file)))
}

async fn move_file(from: &Path, to: &Path) -> Result<(), FileError> {
    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FileError::io(parent, e))?;
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| FileError::io(to, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn init_at(path: &Path, bytes_so_far: u64) -> FileInit {
        FileInit {
            path: Some(path.to_path_buf()),
            bytes_so_far,
            ..FileInit::default()
        }
    }

    // ==================== Initialize Tests ====================

    #[tokio::test]
    async fn test_initialize_without_path_creates_temp_file_in_default_dir() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::initialize(FileInit {
            default_dir: Some(dir.path().to_path_buf()),
            ..FileInit::default()
        })
        .await
        .unwrap();
        assert!(handle.path().starts_with(dir.path()));
        assert!(handle.path().exists());
        assert!(handle.in_progress());
    }

    #[tokio::test]
    async fn test_initialize_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        let data = sample(300);
        std::fs::write(&path, &data[..200]).unwrap();
        let prefix_hash = ContentHash::of(&data[..200]);

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let mut handle = FileHandle::initialize(FileInit {
                hash_of_partial_file: Some(prefix_hash),
                ..init_at(&path, 200)
            })
            .await
            .unwrap();
            handle.append_data_to_file(&data[200..]).await.unwrap();
            let state = handle.finish().await.unwrap();
            outputs.push(state.finish());
            // Put the file back to the 200-byte prefix for the next round.
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap()
                .set_len(200)
                .unwrap();
            handle.detach();
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], ContentHash::of(&data));
    }

    #[tokio::test]
    async fn test_initialize_truncates_longer_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        let data = sample(500);
        std::fs::write(&path, &data).unwrap();

        let mut handle = FileHandle::initialize(FileInit {
            hash_of_partial_file: Some(ContentHash::of(&data[..300])),
            ..init_at(&path, 300)
        })
        .await
        .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 300);
        assert_eq!(handle.hash_state().finish(), ContentHash::of(&data[..300]));

        handle.append_data_to_file(b"tail").await.unwrap();
        handle.finish().await.unwrap();
        let mut expected = data[..300].to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        handle.detach();
    }

    #[tokio::test]
    async fn test_initialize_detects_every_flipped_prefix_byte() {
        let dir = TempDir::new().unwrap();
        let data = sample(64);
        let prefix_hash = ContentHash::of(&data);

        for i in 0..data.len() {
            let path = dir.path().join(format!("f{i}.part"));
            let mut corrupted = data.clone();
            corrupted[i] ^= 0xFF;
            std::fs::write(&path, &corrupted).unwrap();

            let err = FileHandle::initialize(FileInit {
                hash_of_partial_file: Some(prefix_hash),
                ..init_at(&path, 64)
            })
            .await
            .unwrap_err();
            assert_eq!(err.reason(), InterruptReason::FileHashMismatch, "byte {i}");
            assert!(path.exists(), "failed initialize must leave the file");
        }
    }

    #[tokio::test]
    async fn test_initialize_short_file_is_too_short() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        std::fs::write(&path, sample(100)).unwrap();

        let err = FileHandle::initialize(init_at(&path, 150)).await.unwrap_err();
        assert_eq!(err.reason(), InterruptReason::FileTooShort);
    }

    #[tokio::test]
    async fn test_initialize_short_file_with_checkpoint_is_too_short() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        let data = sample(150);
        std::fs::write(&path, &data[..100]).unwrap();
        let mut checkpoint = HashState::new();
        checkpoint.update(&data);

        let err = FileHandle::initialize(FileInit {
            hash_state: Some(checkpoint),
            ..init_at(&path, 150)
        })
        .await
        .unwrap_err();
        assert_eq!(err.reason(), InterruptReason::FileTooShort);
    }

    #[tokio::test]
    async fn test_initialize_trusts_matching_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.part");
        let data = sample(100);
        std::fs::write(&path, &data).unwrap();
        let mut checkpoint = HashState::new();
        checkpoint.update(&data);

        let handle = FileHandle::initialize(FileInit {
            hash_state: Some(checkpoint),
            ..init_at(&path, 100)
        })
        .await
        .unwrap();
        assert_eq!(handle.hash_state().finish(), ContentHash::of(&data));
    }

    // ==================== Append Tests ====================

    #[tokio::test]
    async fn test_byte_chunks_match_single_append() {
        let dir = TempDir::new().unwrap();
        let data = sample(777);

        let whole_path = dir.path().join("whole");
        let mut whole = FileHandle::initialize(init_at(&whole_path, 0)).await.unwrap();
        whole.append_data_to_file(&data).await.unwrap();
        let whole_hash = whole.finish().await.unwrap().finish();
        whole.detach();

        let bytes_path = dir.path().join("bytes");
        let mut bytes = FileHandle::initialize(init_at(&bytes_path, 0)).await.unwrap();
        for b in &data {
            bytes.append_data_to_file(std::slice::from_ref(b)).await.unwrap();
        }
        assert_eq!(bytes.bytes_so_far(), 777);
        let bytes_hash = bytes.finish().await.unwrap().finish();
        bytes.detach();

        assert_eq!(whole_hash, bytes_hash);
        assert_eq!(
            std::fs::read(&whole_path).unwrap(),
            std::fs::read(&bytes_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_zero_length_append_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut handle = FileHandle::initialize(init_at(&dir.path().join("f"), 0))
            .await
            .unwrap();
        handle.append_data_to_file(&[]).await.unwrap();
        assert_eq!(handle.bytes_so_far(), 0);
    }

    #[tokio::test]
    async fn test_append_after_detach_is_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let mut handle = FileHandle::initialize(init_at(&path, 0)).await.unwrap();
        handle.detach();
        handle.append_data_to_file(b"late").await.unwrap();
        assert_eq!(handle.detached_appends(), 1);
        drop(handle);
        assert!(path.exists());
    }

    // ==================== Rename Tests ====================

    #[tokio::test]
    async fn test_rename_moves_and_keeps_writing() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.part");
        let to = dir.path().join("nested").join("a.bin");
        let mut handle = FileHandle::initialize(init_at(&from, 0)).await.unwrap();
        handle.append_data_to_file(b"hello ").await.unwrap();

        handle.rename(&to).await.unwrap();
        assert_eq!(handle.path(), to);
        assert!(!from.exists());
        assert!(handle.in_progress());

        handle.append_data_to_file(b"world").await.unwrap();
        handle.finish().await.unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"hello world");
        handle.detach();
    }

    #[tokio::test]
    async fn test_rename_to_same_path_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        let mut handle = FileHandle::initialize(init_at(&path, 0)).await.unwrap();
        handle.rename(&path).await.unwrap();
        assert!(handle.in_progress());
    }

    // ==================== Ownership Tests ====================

    #[tokio::test]
    async fn test_cancel_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        let mut handle = FileHandle::initialize(init_at(&path, 0)).await.unwrap();
        handle.append_data_to_file(b"x").await.unwrap();
        handle.cancel().await;
        assert!(!path.exists());
        assert!(handle.is_detached());
    }

    #[tokio::test]
    async fn test_drop_deletes_undetached_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        let handle = FileHandle::initialize(init_at(&path, 0)).await.unwrap();
        drop(handle);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_keeps_detached_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        let mut handle = FileHandle::initialize(init_at(&path, 0)).await.unwrap();
        handle.append_data_to_file(b"keep").await.unwrap();
        handle.finish().await.unwrap();
        handle.detach();
        drop(handle);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }
}
