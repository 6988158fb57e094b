//! A delegate that saves every download into one directory.
//!
//! Targets are named from `Content-Disposition` or the URL, uniquified
//! against existing files, and written through `<target>.part` until
//! complete. Resumptions are issued through an [`HttpClient`].

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::delegate::{
    DangerType, DownloadDelegate, DownloadTarget, ResumeParameters, ResumptionCallback,
    TargetCallback, TargetDisposition, non_empty,
};
use super::filename::{filename_for_download, intermediate_path_for, resolve_unique_path};
use super::http::{DownloadRequest, HttpClient, spawn_resumption};
use super::item::DownloadItem;

#[derive(Debug, Clone)]
pub struct DirectoryDelegate {
    dir: PathBuf,
    client: HttpClient,
    disposition: TargetDisposition,
}

impl DirectoryDelegate {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, client: HttpClient) -> Self {
        Self {
            dir: dir.into(),
            client,
            disposition: TargetDisposition::Uniquify,
        }
    }

    /// `Overwrite` replaces an existing file at the target instead of
    /// picking a ` (n)` name.
    #[must_use]
    pub fn with_disposition(mut self, disposition: TargetDisposition) -> Self {
        self.disposition = disposition;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pick_target(&self, item: &DownloadItem) -> Option<PathBuf> {
        // A restored or resumed item keeps the name it already had.
        if let Some(existing) = non_empty(item.target_path()) {
            return Some(existing.to_path_buf());
        }
        let name = filename_for_download(item.content_disposition(), item.url());
        let candidate = self.dir.join(name);
        match self.disposition {
            TargetDisposition::Overwrite | TargetDisposition::Prompt => Some(candidate),
            TargetDisposition::Uniquify => resolve_unique_path(&candidate, None),
        }
    }
}

impl DownloadDelegate for DirectoryDelegate {
    fn determine_target(&self, item: &DownloadItem, callback: TargetCallback) {
        let Some(target_path) = self.pick_target(item) else {
            warn!(url = %item.url(), dir = %self.dir.display(), "no free file name, cancelling");
            callback.run(DownloadTarget::cancelled());
            return;
        };
        let intermediate_path = match non_empty(item.current_path()) {
            Some(current) => current.to_path_buf(),
            None => intermediate_path_for(&target_path),
        };
        debug!(
            target = %target_path.display(),
            intermediate = %intermediate_path.display(),
            "target chosen"
        );
        callback.run(DownloadTarget {
            target_path,
            disposition: self.disposition,
            danger_type: DangerType::NotDangerous,
            intermediate_path,
        });
    }

    fn resume_interrupted_download(
        &self,
        params: ResumeParameters,
        download_id: u32,
        callback: ResumptionCallback,
    ) {
        debug!(download_id, offset = params.offset, url = %params.url, "issuing resumption");
        let request = DownloadRequest::from_resume(params, Some(self.dir.clone()));
        spawn_resumption(&self.client, request, callback);
    }
}
