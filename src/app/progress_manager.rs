//! Progress bar driven by download item updates.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use resumable_downloader_core::download::{DownloadItem, DownloadObserver, DownloadState};

const BAR_TEMPLATE: &str =
    "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner} {msg} {bytes} ({binary_bytes_per_sec})";

/// Mirrors item progress onto an indicatif bar.
pub(crate) struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub(crate) fn new(label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template(SPINNER_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn set_total(&self, total: u64) {
        if self.bar.length() == Some(total) {
            return;
        }
        self.bar.set_length(total);
        self.bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
    }
}

impl DownloadObserver for ProgressObserver {
    fn on_updated(&self, item: &DownloadItem) {
        if item.total_bytes() > 0 {
            self.set_total(item.total_bytes());
        }
        self.bar.set_position(item.received_bytes());
        match item.state() {
            DownloadState::Interrupted => {
                let reason = item
                    .last_reason()
                    .map_or_else(|| "unknown".to_string(), |r| r.to_string());
                self.bar.set_message(format!("interrupted ({reason})"));
            }
            DownloadState::Resuming => self.bar.set_message("resuming"),
            _ => {}
        }
    }
}

pub(crate) fn spawn_progress_observer(
    enabled: bool,
    item: &DownloadItem,
) -> Option<Arc<ProgressObserver>> {
    if !enabled {
        return None;
    }
    let label = item
        .target_path()
        .file_name()
        .map_or_else(|| item.url().to_string(), |name| name.to_string_lossy().into_owned());
    let observer = Arc::new(ProgressObserver::new(&label));
    item.add_observer(Arc::clone(&observer) as Arc<dyn DownloadObserver>);
    Some(observer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_parse() {
        assert!(ProgressStyle::with_template(BAR_TEMPLATE).is_ok());
        assert!(ProgressStyle::with_template(SPINNER_TEMPLATE).is_ok());
    }

    #[test]
    fn test_set_total_switches_to_bar() {
        let observer = ProgressObserver::new("file.bin");
        observer.set_total(100);
        assert_eq!(observer.bar.length(), Some(100));
        observer.finish();
    }
}
