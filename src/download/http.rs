//! HTTP request issuer.
//!
//! [`HttpClient`] turns a [`DownloadRequest`] (URL, offset, validators) into
//! the three things a [`DownloadItem`](super::item::DownloadItem) needs to
//! start: a [`DownloadCreateInfo`] describing the response, a
//! [`DestinationWriter`] fed by the response body, and a request handle for
//! pause/resume/cancel.
//!
//! Resumption sends `Range: bytes=<offset>-` together with `If-Range`
//! carrying the strongest known validator. A server that answers a range
//! request with anything other than `206` for that exact offset is reported
//! as [`InterruptReason::ServerNoRange`], which makes the item restart.
//!
//! # Example
//!
//! ```no_run
//! use resumable_downloader_core::download::{DownloadRequest, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! match client.start(DownloadRequest::new("https://example.com/file.pdf")).await {
//!     Ok(started) => println!("total: {}", started.info.total_bytes),
//!     Err(failure) => println!("failed: {}", failure.error),
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE,
    LAST_MODIFIED, RANGE, REFERER,
};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_STREAM_CAPACITY, READ_TIMEOUT_SECS};
use super::delegate::{DownloadCreateInfo, RequestHandle, ResumeParameters, ResumptionCallback};
use super::error::RequestError;
use super::file::FileInit;
use super::interrupt::InterruptReason;
use super::stream::{ByteStreamWriter, byte_stream};
use super::writer::{DestinationWriter, WriterParams};
use crate::user_agent;

/// What to fetch and where its bytes go.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub referrer: Option<String>,
    /// First byte wanted. Non-zero sends a range request.
    pub offset: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// How the writer opens its file. `bytes_so_far` is forced to `offset`.
    pub file: FileInit,
    pub guid: Option<String>,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// A request continuing where `params` left off.
    ///
    /// `default_dir` is used for a fresh temporary file when the partial file
    /// was discarded.
    #[must_use]
    pub fn from_resume(params: ResumeParameters, default_dir: Option<PathBuf>) -> Self {
        Self {
            url: params.url,
            referrer: params.referrer,
            offset: params.offset,
            etag: params.etag,
            last_modified: params.last_modified,
            file: FileInit {
                path: params.file_path,
                default_dir,
                bytes_so_far: params.offset,
                hash_of_partial_file: params.hash_of_partial_file,
                hash_state: params.hash_state,
            },
            guid: Some(params.guid),
        }
    }

    fn validator(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .filter(|etag| !etag.is_empty())
            .or_else(|| self.last_modified.as_deref().filter(|lm| !lm.is_empty()))
    }
}

/// A request whose response headers arrived.
pub struct StartedRequest {
    pub writer: DestinationWriter,
    pub request: HttpRequestHandle,
    pub info: DownloadCreateInfo,
}

impl std::fmt::Debug for StartedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedRequest")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A request that failed before producing data.
#[derive(Debug)]
pub struct RequestFailure {
    pub error: RequestError,
    /// Carries `result`, the offset and the hash state of the request.
    pub info: DownloadCreateInfo,
}

/// HTTP client for download requests.
///
/// Created once and shared; cloning is cheap and keeps the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    stream_capacity: usize,
}

impl HttpClient {
    /// Creates a client with the default timeouts (30s connect, 300s read).
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Client`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, RequestError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// The read timeout applies between body chunks, not to the whole
    /// transfer, so large downloads are not cut off.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Client`] if the HTTP client cannot be built.
    #[instrument(level = "debug")]
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, RequestError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(user_agent::default_download_user_agent())
            .build()
            .map_err(|source| RequestError::Client { source })?;
        Ok(Self {
            client,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        })
    }

    /// Sets how many body chunks may be buffered ahead of the writer.
    #[must_use]
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity.max(1);
        self
    }

    /// Sends the request and, once headers arrive, spawns the body pump.
    ///
    /// # Errors
    ///
    /// Returns [`RequestFailure`] if the URL is unusable, the request fails,
    /// the server answers with an error status, or a range request is not
    /// honored.
    #[instrument(skip(self, request), fields(url = %request.url, offset = request.offset))]
    pub async fn start(&self, request: DownloadRequest) -> Result<StartedRequest, RequestFailure> {
        match self.send(&request).await {
            Ok(response) => Ok(self.begin_body(request, response)),
            Err(error) => {
                warn!(error = %error, "download request failed");
                Err(RequestFailure {
                    info: failed_info(&request, error.reason()),
                    error,
                })
            }
        }
    }

    /// Runs [`HttpClient::start`] and reports the outcome through `callback`.
    pub async fn start_with_callback(&self, request: DownloadRequest, callback: ResumptionCallback) {
        match self.start(request).await {
            Ok(started) => {
                callback.started(started.writer, Box::new(started.request), started.info);
            }
            Err(failure) => callback.failed(failure.error.reason(), failure.info),
        }
    }

    async fn send(&self, request: &DownloadRequest) -> Result<Response, RequestError> {
        let url = Url::parse(&request.url).map_err(|_| RequestError::invalid_url(&request.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::UnsupportedScheme {
                url: request.url.clone(),
            });
        }

        let mut builder = self.client.get(url);
        if let Some(referrer) = &request.referrer {
            builder = builder.header(REFERER, referrer);
        }
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
            if let Some(validator) = request.validator() {
                builder = builder.header(IF_RANGE, validator);
            }
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RequestError::timeout(&request.url)
            } else {
                RequestError::network(&request.url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::http_status(&request.url, status.as_u16()));
        }
        if request.offset > 0 {
            let range_start = header_str(&response, CONTENT_RANGE)
                .and_then(parse_content_range)
                .map(|(start, _)| start);
            if status != StatusCode::PARTIAL_CONTENT || range_start != Some(request.offset) {
                return Err(RequestError::NoRange {
                    url: request.url.clone(),
                    offset: request.offset,
                    status: status.as_u16(),
                });
            }
        }
        Ok(response)
    }

    fn begin_body(
        &self,
        request: DownloadRequest,
        response: Response,
    ) -> StartedRequest {
        let info = Self::create_info(&request, &response);
        debug!(
            status = response.status().as_u16(),
            total_bytes = info.total_bytes,
            etag = ?info.etag,
            "response headers received"
        );

        let (network, pipe) = byte_stream(self.stream_capacity);
        let (control_tx, control_rx) = watch::channel(PumpControl::Running);
        let source_url = info.url().unwrap_or(&request.url).to_string();
        tokio::spawn(pump_body(response, network, control_rx, source_url.clone()));

        let mut file = request.file;
        file.bytes_so_far = request.offset;
        let writer = DestinationWriter::new(
            WriterParams {
                file,
                source_url,
                referrer: request.referrer,
            },
            Box::new(pipe),
        );
        StartedRequest {
            writer,
            request: HttpRequestHandle {
                control: control_tx,
            },
            info,
        }
    }

    fn create_info(request: &DownloadRequest, response: &Response) -> DownloadCreateInfo {
        let mut url_chain = vec![request.url.clone()];
        let final_url = response.url().as_str();
        if final_url != request.url {
            url_chain.push(final_url.to_string());
        }
        let content_length: Option<u64> =
            header_str(response, CONTENT_LENGTH).and_then(|v| v.parse().ok());
        let total_bytes = if response.status() == StatusCode::PARTIAL_CONTENT {
            header_str(response, CONTENT_RANGE)
                .and_then(parse_content_range)
                .and_then(|(_, total)| total)
                .or_else(|| content_length.map(|len| request.offset.saturating_add(len)))
        } else {
            content_length
        };
        let mime_type = header_str(response, CONTENT_TYPE).map(str::to_string);

        DownloadCreateInfo {
            result: None,
            url_chain,
            referrer: request.referrer.clone(),
            etag: header_str(response, ETAG).map(str::to_string),
            last_modified: header_str(response, LAST_MODIFIED).map(str::to_string),
            content_disposition: header_str(response, CONTENT_DISPOSITION).map(str::to_string),
            original_mime_type: mime_type.clone(),
            mime_type,
            remote_address: response.remote_addr().map(|addr| addr.ip().to_string()),
            total_bytes: total_bytes.unwrap_or(0),
            offset: request.offset,
            hash_state: request.file.hash_state.clone(),
            save_path: request.file.path.clone(),
            guid: request.guid.clone(),
            ..DownloadCreateInfo::default()
        }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn failed_info(request: &DownloadRequest, reason: InterruptReason) -> DownloadCreateInfo {
    DownloadCreateInfo {
        result: Some(reason),
        url_chain: vec![request.url.clone()],
        referrer: request.referrer.clone(),
        etag: request.etag.clone(),
        last_modified: request.last_modified.clone(),
        offset: request.offset,
        hash_state: request.file.hash_state.clone(),
        save_path: request.file.path.clone(),
        guid: request.guid.clone(),
        ..DownloadCreateInfo::default()
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Parses `bytes <start>-<end>/<total|*>` into the start and the total.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        value => Some(value.parse().ok()?),
    };
    Some((start, total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpControl {
    Running,
    Paused,
    Cancelled,
}

/// Pause/resume/cancel for one HTTP response body.
#[derive(Debug)]
pub struct HttpRequestHandle {
    control: watch::Sender<PumpControl>,
}

impl HttpRequestHandle {
    fn set(&self, from: Option<PumpControl>, to: PumpControl) {
        self.control.send_if_modified(|current| {
            let applies = *current != PumpControl::Cancelled
                && from.is_none_or(|expected| *current == expected);
            if applies {
                *current = to;
            }
            applies
        });
    }
}

impl RequestHandle for HttpRequestHandle {
    fn pause(&self) {
        self.set(Some(PumpControl::Running), PumpControl::Paused);
    }

    fn resume(&self) {
        self.set(Some(PumpControl::Paused), PumpControl::Running);
    }

    fn cancel(&self) {
        self.set(None, PumpControl::Cancelled);
    }
}

/// Copies the response body into the pipe until it ends, fails or is cancelled.
async fn pump_body(
    response: Response,
    network: ByteStreamWriter,
    mut control: watch::Receiver<PumpControl>,
    url: String,
) {
    let mut body = response.bytes_stream();
    let mut handle_alive = true;
    let mut bytes: u64 = 0;

    loop {
        let state = *control.borrow_and_update();
        match state {
            PumpControl::Cancelled => {
                debug!(url = %url, bytes, "request cancelled");
                network.close(Err(InterruptReason::UserCanceled));
                return;
            }
            PumpControl::Paused if handle_alive => {
                if control.changed().await.is_err() {
                    handle_alive = false;
                }
                continue;
            }
            PumpControl::Paused | PumpControl::Running => {}
        }

        tokio::select! {
            changed = control.changed(), if handle_alive => {
                if changed.is_err() {
                    handle_alive = false;
                }
            }
            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => {
                    bytes += chunk.len() as u64;
                    if network.write(chunk).await.is_err() {
                        debug!(url = %url, "writer went away, stopping body");
                        return;
                    }
                }
                Some(Err(error)) => {
                    let reason = if error.is_timeout() {
                        InterruptReason::NetworkTimeout
                    } else {
                        InterruptReason::NetworkFailed
                    };
                    info!(url = %url, bytes, error = %error, %reason, "response body failed");
                    network.close(Err(reason));
                    return;
                }
                None => {
                    debug!(url = %url, bytes, "response body complete");
                    network.close(Ok(()));
                    return;
                }
            },
        }
    }
}

/// Issues resumptions on the current runtime, or fails them when there is none.
pub(crate) fn spawn_resumption(
    client: &HttpClient,
    request: DownloadRequest,
    callback: ResumptionCallback,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            let client = client.clone();
            runtime.spawn(async move { client.start_with_callback(request, callback).await });
        }
        Err(_) => {
            warn!(url = %request.url, "no async runtime to issue resumption");
            let info = failed_info(&request, InterruptReason::NetworkFailed);
            callback.failed(InterruptReason::NetworkFailed, info);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::download::hash::ContentHash;
    use crate::download::writer::WriterEvent;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    async fn drain(started: StartedRequest) -> WriterEvent {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = started.writer.spawn(Arc::new(tx));
        loop {
            match rx.recv().await.unwrap() {
                WriterEvent::Initialized(Ok(())) | WriterEvent::Update { .. } => {}
                event => {
                    handle.detach();
                    return event;
                }
            }
        }
    }

    // ==================== Content-Range Tests ====================

    #[test]
    fn test_parse_content_range_with_total() {
        assert_eq!(parse_content_range("bytes 4-9/10"), Some((4, Some(10))));
    }

    #[test]
    fn test_parse_content_range_unknown_total() {
        assert_eq!(parse_content_range("bytes 100-199/*"), Some((100, None)));
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        assert_eq!(parse_content_range("items 1-2/3"), None);
        assert_eq!(parse_content_range("bytes 9-4/10"), None);
        assert_eq!(parse_content_range("bytes */10"), None);
    }

    // ==================== Request Tests ====================

    #[tokio::test]
    async fn test_start_full_response_fills_info_and_streams_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/paper.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let url = format!("{}/paper.pdf", server.uri());
        let request = DownloadRequest {
            file: FileInit {
                default_dir: Some(dir.path().to_path_buf()),
                ..FileInit::default()
            },
            ..DownloadRequest::new(&url)
        };

        let started = HttpClient::new().unwrap().start(request).await.unwrap();
        assert_eq!(started.info.url_chain, vec![url]);
        assert_eq!(started.info.etag.as_deref(), Some("\"abc\""));
        assert_eq!(started.info.total_bytes, 10);
        assert_eq!(started.info.offset, 0);
        assert_eq!(started.info.mime_type.as_deref(), Some("application/pdf"));

        match drain(started).await {
            WriterEvent::Completed {
                total_bytes,
                hash_state,
            } => {
                assert_eq!(total_bytes, 10);
                assert_eq!(hash_state.finish(), ContentHash::of(b"0123456789"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_range_request_appends_to_partial_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/data.bin"))
            .and(header("Range", "bytes=4-"))
            .and(header("If-Range", "\"abc\""))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 4-9/10")
                    .insert_header("ETag", "\"abc\"")
                    .set_body_bytes(b"456789".to_vec()),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("data.bin.part");
        std::fs::write(&partial, b"0123").unwrap();

        let request = DownloadRequest {
            offset: 4,
            etag: Some("\"abc\"".to_string()),
            file: FileInit {
                path: Some(partial.clone()),
                hash_of_partial_file: Some(ContentHash::of(b"0123")),
                ..FileInit::default()
            },
            ..DownloadRequest::new(format!("{}/data.bin", server.uri()))
        };
        let started = HttpClient::new().unwrap().start(request).await.unwrap();
        assert_eq!(started.info.total_bytes, 10);
        assert_eq!(started.info.offset, 4);

        match drain(started).await {
            WriterEvent::Completed {
                total_bytes,
                hash_state,
            } => {
                assert_eq!(total_bytes, 10);
                assert_eq!(hash_state.finish(), ContentHash::of(b"0123456789"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(std::fs::read(&partial).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_full_response_to_range_request_is_no_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/changed.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"brand new".to_vec()))
            .mount(&server)
            .await;

        let request = DownloadRequest {
            offset: 4,
            etag: Some("\"old\"".to_string()),
            ..DownloadRequest::new(format!("{}/changed.bin", server.uri()))
        };
        let failure = HttpClient::new().unwrap().start(request).await.unwrap_err();
        assert!(matches!(failure.error, RequestError::NoRange { status: 200, .. }));
        assert_eq!(failure.info.result, Some(InterruptReason::ServerNoRange));
        assert_eq!(failure.info.offset, 4);
    }

    #[tokio::test]
    async fn test_error_status_maps_to_reason() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let failure = client
            .start(DownloadRequest::new(format!("{}/secret", server.uri())))
            .await
            .unwrap_err();
        assert_eq!(failure.info.result, Some(InterruptReason::ServerForbidden));

        let failure = client
            .start(DownloadRequest::new(format!("{}/busy", server.uri())))
            .await
            .unwrap_err();
        assert_eq!(failure.info.result, Some(InterruptReason::ServerFailed));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected_before_sending() {
        let client = HttpClient::new().unwrap();
        let failure = client
            .start(DownloadRequest::new("ftp://example.com/file.bin"))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            RequestError::UnsupportedScheme { .. }
        ));
        assert_eq!(failure.info.result, Some(InterruptReason::UnsupportedScheme));

        let failure = client
            .start(DownloadRequest::new("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, RequestError::InvalidUrl { .. }));
    }

    // ==================== Request Handle Tests ====================

    #[test]
    fn test_request_handle_transitions() {
        let (control, rx) = watch::channel(PumpControl::Running);
        let handle = HttpRequestHandle { control };

        handle.resume();
        assert_eq!(*rx.borrow(), PumpControl::Running);
        handle.pause();
        handle.pause();
        assert_eq!(*rx.borrow(), PumpControl::Paused);
        handle.resume();
        assert_eq!(*rx.borrow(), PumpControl::Running);
        handle.cancel();
        handle.resume();
        assert_eq!(*rx.borrow(), PumpControl::Cancelled);
    }
}
