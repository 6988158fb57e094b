//! Loading and saving the download record used for warm restart.

use std::path::Path;

use anyhow::{Context, Result};
use resumable_downloader_core::download::DownloadRecord;
use tracing::debug;

/// Reads the record at `path`, or `None` if the file does not exist.
pub(crate) fn load(path: &Path) -> Result<Option<DownloadRecord>> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("reading state file {}", path.display()));
        }
    };
    let record = DownloadRecord::from_json(&json)
        .with_context(|| format!("parsing state file {}", path.display()))?;
    debug!(path = %path.display(), guid = %record.guid, "loaded download state");
    Ok(Some(record))
}

/// Writes the record atomically: a sibling temp file is renamed over `path`.
pub(crate) fn save(path: &Path, record: &DownloadRecord) -> Result<()> {
    let json = record.to_json()?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating state directory {}", dir.display()))?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    std::fs::write(temp.path(), json)
        .with_context(|| format!("writing state to {}", temp.path().display()))?;
    temp.persist(path)
        .with_context(|| format!("saving state file {}", path.display()))?;
    debug!(path = %path.display(), state = ?record.state, "saved download state");
    Ok(())
}
