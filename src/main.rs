//! CLI entry point for the resumable downloader.

use std::process::ExitCode;

use anyhow::Result;

mod app;
mod cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let exit = app::runtime::run_downloader().await?;
    Ok(ExitCode::from(exit.code()))
}
