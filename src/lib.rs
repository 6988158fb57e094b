//! Resumable Downloader Core Library
//!
//! This library persists a download's byte stream to disk and survives
//! interruptions: network drops, server errors, local file errors and
//! process restarts. Partial data is verified by hash before it is reused,
//! and the download continues from the verified offset with a range request.
//!
//! # Architecture
//!
//! - [`download`] - file handle, destination writer, download item state
//!   machine, HTTP request issuer and the directory-backed delegate
//!
//! The `resumable-downloader` binary drives a single [`DownloadItem`] from
//! the command line and saves its [`DownloadRecord`] for warm restart.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use download::{
    DestinationWriter, DirectoryDelegate, DownloadDelegate, DownloadItem, DownloadObserver,
    DownloadRecord, DownloadRequest, DownloadState, EngineConfig, FileHandle, HttpClient,
    InterruptReason, ResumeMode, RetryPolicy,
};
