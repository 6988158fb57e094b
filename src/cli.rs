//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use resumable_downloader_core::download::{
    CONNECT_TIMEOUT_SECS, MAX_AUTO_RESUME_ATTEMPTS, READ_TIMEOUT_SECS,
};

/// Download one URL, resuming from verified partial data after interruptions.
///
/// With --state-file the download survives process restarts: the state is
/// saved on exit and the next run with the same file continues where the
/// last one stopped.
#[derive(Parser, Debug)]
#[command(name = "resumable-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// URL to download (optional when resuming from --state-file)
    pub url: Option<String>,

    /// Directory the file is saved into
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// JSON file holding the download state for warm restart
    #[arg(short = 's', long)]
    pub state_file: Option<PathBuf>,

    /// Automatic resumptions before giving up (0-100)
    #[arg(short = 'r', long, default_value_t = MAX_AUTO_RESUME_ATTEMPTS, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub max_auto_resumes: u32,

    /// Connection timeout in seconds (1-600)
    #[arg(long, default_value_t = CONNECT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub connect_timeout: u64,

    /// Timeout between body reads in seconds (1-3600)
    #[arg(long, default_value_t = READ_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub read_timeout: u64,

    /// Start over when the server's validators changed since the partial download
    #[arg(long)]
    pub restart_on_change: bool,

    /// Restart automatically when the partial file fails verification
    #[arg(long)]
    pub no_integrity_hold: bool,

    /// Do not show a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
