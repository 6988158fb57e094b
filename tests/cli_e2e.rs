//! End-to-end CLI tests for the resumable-downloader binary.

// `Command::cargo_bin` is deprecated in assert_cmd >=2.0.17 in favor of
// `cargo::cargo_bin_cmd!` macro. Suppressed until migration to the new API.
#![allow(deprecated)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use resumable_downloader_core::download::{
    ContentHash, DangerType, DownloadRecord, ExternalState, InterruptReason,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::should_skip_socket_bound_test;

const BODY: &[u8] = b"The quick brown fox jumps over the lazy dog";

fn downloader() -> Command {
    let mut cmd = Command::cargo_bin("resumable-downloader").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Starts a mock server on its own thread so the binary can reach it while
/// the test blocks on the child process.
fn mock_server() -> Option<MockServer> {
    if should_skip_socket_bound_test() {
        return None;
    }
    Some(tokio_test::block_on(MockServer::start()))
}

fn mount(server: &MockServer, mock: Mock) {
    tokio_test::block_on(mock.mount(server));
}

fn partial_record(url: String, dir: &Path, saved: usize) -> DownloadRecord {
    DownloadRecord {
        guid: "9E4A7C21-0D3B-4F6A-8B2E-5C1D7F9A3B60".to_string(),
        url_chain: vec![url],
        referrer: None,
        site_url: None,
        tab_url: None,
        tab_referrer_url: None,
        mime_type: None,
        original_mime_type: None,
        current_path: dir.join("fox.txt.part"),
        target_path: dir.join("fox.txt"),
        received_bytes: saved as u64,
        total_bytes: BODY.len() as u64,
        etag: Some("\"fox\"".to_string()),
        last_modified: None,
        hash: Some(ContentHash::of(&BODY[..saved]).to_hex()),
        danger_type: DangerType::NotDangerous,
        state: ExternalState::InProgress,
        interrupt_reason: None,
        opened: false,
        start_time: 1_700_000_000,
        end_time: None,
    }
}

// ==================== Argument Tests ====================

#[test]
fn test_binary_help_lists_options() {
    downloader()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--max-auto-resumes"));
}

#[test]
fn test_binary_version() {
    downloader()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_binary_without_url_or_state_fails() {
    let dir = TempDir::new().unwrap();
    downloader()
        .current_dir(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no URL given"));
}

#[test]
fn test_binary_rejects_corrupt_state_file() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state.json");
    std::fs::write(&state, "not json").unwrap();

    downloader()
        .arg("--state-file")
        .arg(&state)
        .arg("-o")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsing state file"));
}

// ==================== Download Tests ====================

#[test]
fn test_binary_downloads_file_and_prints_path() {
    let Some(server) = mock_server() else {
        return;
    };
    mount(
        &server,
        Mock::given(method("GET"))
            .and(path("/fox.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY.to_vec())),
    );
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state.json");

    downloader()
        .arg(format!("{}/fox.txt", server.uri()))
        .arg("-o")
        .arg(dir.path())
        .arg("--state-file")
        .arg(&state)
        .arg("--no-progress")
        .arg("-q")
        .assert()
        .success()
        .stdout(predicate::str::contains("fox.txt"));

    assert_eq!(std::fs::read(dir.path().join("fox.txt")).unwrap(), BODY);
    assert!(!state.exists(), "state file should be removed after completion");
}

#[test]
fn test_binary_forbidden_exits_with_failure() {
    let Some(server) = mock_server() else {
        return;
    };
    mount(
        &server,
        Mock::given(method("GET"))
            .and(path("/secret.txt"))
            .respond_with(ResponseTemplate::new(403)),
    );
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state.json");

    downloader()
        .arg(format!("{}/secret.txt", server.uri()))
        .arg("-o")
        .arg(dir.path())
        .arg("--state-file")
        .arg(&state)
        .arg("--no-progress")
        .assert()
        .failure()
        .code(1);

    let saved = DownloadRecord::from_json(&std::fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(saved.state, ExternalState::Interrupted);
    assert_eq!(saved.interrupt_reason, Some(InterruptReason::ServerForbidden));
}

#[test]
fn test_binary_continues_from_state_file() {
    let Some(server) = mock_server() else {
        return;
    };
    let saved = 16;
    mount(
        &server,
        Mock::given(method("GET"))
            .and(path("/fox.txt"))
            .and(header("Range", format!("bytes={saved}-").as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {saved}-{}/{}", BODY.len() - 1, BODY.len()).as_str(),
                    )
                    .insert_header("ETag", "\"fox\"")
                    .set_body_bytes(BODY[saved..].to_vec()),
            ),
    );
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("fox.txt.part"), &BODY[..saved]).unwrap();
    let state = dir.path().join("state.json");
    let record = partial_record(format!("{}/fox.txt", server.uri()), dir.path(), saved);
    std::fs::write(&state, record.to_json().unwrap()).unwrap();

    downloader()
        .arg("-o")
        .arg(dir.path())
        .arg("--state-file")
        .arg(&state)
        .arg("--no-progress")
        .assert()
        .success();

    assert_eq!(std::fs::read(dir.path().join("fox.txt")).unwrap(), BODY);
    assert!(!dir.path().join("fox.txt.part").exists());
    assert!(!state.exists());
}
