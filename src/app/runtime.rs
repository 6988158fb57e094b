use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use resumable_downloader_core::download::{
    DirectoryDelegate, DownloadItem, DownloadRequest, DownloadState, EngineConfig, FileInit,
    HttpClient, OriginChangePolicy, RequestHandle,
};
use tracing::{debug, info, warn};

use crate::app::exit_handler::{ProcessExit, determine_exit_outcome};
use crate::app::{progress_manager, state_file, terminal};
use crate::cli::Args;

const ITEM_ID: u32 = 1;

pub(crate) async fn run_downloader() -> Result<ProcessExit> {
    let args = Args::parse();

    terminal::init_tracing(terminal::resolve_default_log_level(&args));
    debug!(?args, "CLI arguments parsed");

    let config = engine_config(&args);
    config.validate()?;

    let client = HttpClient::with_timeouts(
        Duration::from_secs(args.connect_timeout),
        Duration::from_secs(args.read_timeout),
    )?
    .with_stream_capacity(config.stream_capacity);

    if !args.output_dir.exists() {
        std::fs::create_dir_all(&args.output_dir).with_context(|| {
            format!("creating output directory {}", args.output_dir.display())
        })?;
        info!(dir = %args.output_dir.display(), "Created output directory");
    }
    let delegate = Arc::new(DirectoryDelegate::new(&args.output_dir, client.clone()));

    let restored = match args.state_file.as_deref() {
        Some(path) => state_file::load(path)?,
        None => None,
    };

    let mut item = if let Some(record) = restored {
        let recorded_url = record.url_chain.first().cloned().unwrap_or_default();
        if let Some(url) = args.url.as_deref()
            && recorded_url != url
        {
            bail!("state file belongs to {recorded_url}, not {url}");
        }
        let mut item = DownloadItem::from_record(ITEM_ID, record, delegate, config)?;
        match item.state() {
            DownloadState::Complete => {
                info!(path = %item.target_path().display(), "Download already complete");
                return Ok(ProcessExit::Success);
            }
            DownloadState::Interrupted if item.can_resume() => {
                info!(
                    url = %item.url(),
                    received = item.received_bytes(),
                    reason = ?item.last_reason(),
                    "Resuming download from state file"
                );
                item.resume();
            }
            state => bail!("download in state file cannot be resumed ({state})"),
        }
        item
    } else {
        let Some(url) = args.url.clone() else {
            bail!("no URL given and no state file to resume from");
        };
        start_new(url, &args, &client, delegate, config).await
    };

    let show_progress = terminal::should_use_progress_bar(
        io::stderr().is_terminal(),
        args.quiet,
        args.no_progress,
        terminal::is_dumb_terminal(),
    );
    let progress = progress_manager::spawn_progress_observer(show_progress, &item);

    let interrupted = drive(&mut item).await;

    if let Some(progress) = &progress {
        progress.finish();
    }
    if let Some(path) = args.state_file.as_deref() {
        save_state(path, &item)?;
    }

    if interrupted {
        warn!(
            received = item.received_bytes(),
            "Stopped by user; run again with the same state file to continue"
        );
        return Ok(ProcessExit::Resumable);
    }

    let exit = determine_exit_outcome(item.state(), item.resume_mode());
    report_outcome(&item, exit);
    Ok(exit)
}

fn engine_config(args: &Args) -> EngineConfig {
    EngineConfig {
        max_auto_resume_attempts: args.max_auto_resumes,
        hold_on_local_corruption: !args.no_integrity_hold,
        origin_change_policy: if args.restart_on_change {
            OriginChangePolicy::Restart
        } else {
            OriginChangePolicy::LogOnly
        },
        default_download_dir: Some(args.output_dir.clone()),
        ..EngineConfig::default()
    }
}

async fn start_new(
    url: String,
    args: &Args,
    client: &HttpClient,
    delegate: Arc<DirectoryDelegate>,
    config: EngineConfig,
) -> DownloadItem {
    info!(url = %url, dir = %args.output_dir.display(), "Starting download");
    let request = DownloadRequest {
        file: FileInit {
            default_dir: Some(args.output_dir.clone()),
            ..FileInit::default()
        },
        ..DownloadRequest::new(url)
    };
    let (writer, handle, info) = match client.start(request).await {
        Ok(started) => (
            Some(started.writer),
            Some(Box::new(started.request) as Box<dyn RequestHandle>),
            started.info,
        ),
        Err(failure) => {
            warn!(error = %failure.error, "initial request failed");
            (None, None, failure.info)
        }
    };
    let mut item = DownloadItem::new(ITEM_ID, &info, delegate, config);
    item.start(writer, handle, info);
    item
}

/// Runs the item until it settles. Returns `true` when stopped by Ctrl-C.
async fn drive(item: &mut DownloadItem) -> bool {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !is_settled(item) {
        tokio::select! {
            () = item.next_event() => {}
            result = &mut ctrl_c => {
                if let Err(error) = result {
                    warn!(error = %error, "failed to listen for Ctrl-C");
                }
                return true;
            }
        }
    }
    false
}

fn is_settled(item: &DownloadItem) -> bool {
    item.is_done()
        || (item.state() == DownloadState::Interrupted && !item.resume_mode().is_immediate())
}

fn save_state(path: &Path, item: &DownloadItem) -> Result<()> {
    match item.state() {
        DownloadState::Complete | DownloadState::Cancelled => {
            // Nothing left to resume.
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("removing state file {}", path.display()))?;
            }
            Ok(())
        }
        _ => state_file::save(path, &item.to_record()),
    }
}

fn report_outcome(item: &DownloadItem, exit: ProcessExit) {
    match exit {
        ProcessExit::Success => {
            info!(
                path = %item.target_path().display(),
                bytes = item.received_bytes(),
                sha256 = item.hash().map(|hash| hash.to_hex()).unwrap_or_default(),
                "Download complete"
            );
            println!("{}", item.target_path().display());
        }
        ProcessExit::Resumable => {
            warn!(
                reason = ?item.last_reason(),
                received = item.received_bytes(),
                "Download interrupted; run again to continue"
            );
        }
        ProcessExit::Failure => {
            warn!(
                state = %item.state(),
                reason = ?item.last_reason(),
                "Download failed"
            );
        }
    }
}
