//! Fire-and-forget HTTP requests polled from the host tick.
//!
//! [`Requests`] is the contract [`Network`](crate::Network) forwards
//! `get`/`post` calls to. [`HttpRequests`] implements it with `reqwest` on a
//! small private tokio runtime. Requests run one at a time in submission
//! order; callbacks are delivered from [`Requests::update`], on the caller's
//! thread.
//!
//! # Example
//!
//! ```ignore
//! let requests = HttpRequests::new(RequestSettings::default())?;
//! requests.get(
//!     "http://localhost:8080/scores",
//!     Box::new(|body| println!("{} bytes", body.len())),
//!     Some(Box::new(|status| eprintln!("rejected: {status}"))),
//!     0,
//! );
//! loop {
//!     requests.update();
//!     // ...
//! }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

const TARGET: &str = "horizon_lattice_transport::requests";

/// Status the reject callback receives for transport-level failures.
pub const HTTP_BAD_GATEWAY: u16 = 502;

const HTTP_OK: u16 = 200;

/// Called with the response body of a successful (200) request.
pub type OnResponse = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

/// Called with the HTTP status of a failed request, or 502 for transport errors.
pub type OnReject = Box<dyn FnOnce(u16) + Send + 'static>;

/// Contract for the request client a [`Network`](crate::Network) forwards to.
pub trait Requests: Send + Sync {
    /// Queue a GET request. `max_size` bounds the body; 0 means unlimited.
    fn get(&self, url: &str, on_response: OnResponse, on_reject: Option<OnReject>, max_size: u64);

    /// Queue a POST request with a JSON body.
    fn post(
        &self,
        url: &str,
        body: &str,
        on_response: OnResponse,
        on_reject: Option<OnReject>,
        max_size: u64,
    );

    /// Deliver finished requests and start queued ones. Call once per tick.
    fn update(&self);

    /// Bytes sent by completed requests.
    fn total_upload(&self) -> u64;

    /// Bytes received by completed requests.
    fn total_download(&self) -> u64;
}

/// Settings for [`HttpRequests`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// User agent sent with every request.
    pub user_agent: String,
    /// Whole-request timeout. `None` means no timeout.
    pub timeout: Option<Duration>,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            user_agent: "curl/7.81.0".to_string(),
            timeout: None,
            follow_redirects: false,
        }
    }
}

impl RequestSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Follow redirects (up to 10).
    pub fn follow_redirects(mut self, enabled: bool) -> Self {
        self.follow_redirects = enabled;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

struct PendingRequest {
    method: Method,
    url: String,
    body: Option<String>,
    max_size: u64,
    on_response: OnResponse,
    on_reject: Option<OnReject>,
}

struct InFlight {
    url: String,
    on_response: OnResponse,
    on_reject: Option<OnReject>,
}

#[derive(Default)]
struct RequestQueue {
    pending: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
}

#[derive(Debug)]
enum Outcome {
    Success {
        body: Vec<u8>,
        upload: u64,
        download: u64,
    },
    Rejected(u16),
}

/// [`Requests`] backed by `reqwest`.
pub struct HttpRequests {
    runtime: Option<tokio::runtime::Runtime>,
    client: reqwest::Client,
    queue: Mutex<RequestQueue>,
    completed_tx: Sender<Outcome>,
    completed_rx: Receiver<Outcome>,
    total_upload: AtomicU64,
    total_download: AtomicU64,
}

impl HttpRequests {
    /// Start the runtime and build the HTTP client.
    pub fn new(settings: RequestSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("lattice-requests")
            .enable_all()
            .build()
            .map_err(|e| NetworkError::Runtime(e.to_string()))?;

        let client = {
            let _guard = runtime.enter();
            let mut builder = reqwest::Client::builder()
                .user_agent(settings.user_agent.clone())
                .redirect(if settings.follow_redirects {
                    Policy::limited(10)
                } else {
                    Policy::none()
                });
            if let Some(timeout) = settings.timeout {
                builder = builder.timeout(timeout);
            }
            builder
                .build()
                .map_err(|e| NetworkError::Runtime(e.to_string()))?
        };

        let (completed_tx, completed_rx) = unbounded();
        Ok(Self {
            runtime: Some(runtime),
            client,
            queue: Mutex::new(RequestQueue::default()),
            completed_tx,
            completed_rx,
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
        })
    }

    /// Number of requests waiting behind the one in flight.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Whether a request is currently being performed.
    pub fn is_busy(&self) -> bool {
        self.queue.lock().in_flight.is_some()
    }

    fn submit(&self, request: PendingRequest) {
        self.queue.lock().pending.push_back(request);
        self.start_next();
    }

    fn start_next(&self) {
        loop {
            let mut queue = self.queue.lock();
            let Some(runtime) = self.runtime.as_ref() else {
                return;
            };
            if queue.in_flight.is_some() {
                return;
            }
            let Some(request) = queue.pending.pop_front() else {
                return;
            };

            let http_request = match build_request(&self.client, &request) {
                Ok(http_request) => http_request,
                Err(e) => {
                    tracing::error!(target: TARGET, "{} ({})", e, request.url);
                    drop(queue);
                    if let Some(on_reject) = request.on_reject {
                        on_reject(HTTP_BAD_GATEWAY);
                    }
                    continue;
                }
            };

            let client = self.client.clone();
            let completed_tx = self.completed_tx.clone();
            let url = request.url.clone();
            let max_size = request.max_size;
            runtime.spawn(async move {
                let outcome = perform(client, http_request, &url, max_size).await;
                let _ = completed_tx.send(outcome);
            });

            queue.in_flight = Some(InFlight {
                url: request.url,
                on_response: request.on_response,
                on_reject: request.on_reject,
            });
            return;
        }
    }
}

fn build_request(
    client: &reqwest::Client,
    request: &PendingRequest,
) -> std::result::Result<reqwest::Request, reqwest::Error> {
    let builder = match request.method {
        Method::Get => client.get(&request.url),
        Method::Post => client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone().unwrap_or_default()),
    };
    builder.build()
}

fn header_bytes(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.as_bytes().len() + 4) as u64)
        .sum()
}

fn request_bytes(request: &reqwest::Request) -> u64 {
    let request_line = format!("{} {} HTTP/1.1\r\n", request.method(), request.url().path());
    let body = request
        .body()
        .and_then(|body| body.as_bytes())
        .map_or(0, |bytes| bytes.len() as u64);
    request_line.len() as u64 + header_bytes(request.headers()) + 2 + body
}

async fn perform(
    client: reqwest::Client,
    request: reqwest::Request,
    url: &str,
    max_size: u64,
) -> Outcome {
    let upload = request_bytes(&request);

    let mut response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(target: TARGET, "{} ({})", e, url);
            return Outcome::Rejected(HTTP_BAD_GATEWAY);
        }
    };

    let status = response.status().as_u16();
    if status != HTTP_OK {
        tracing::error!(target: TARGET, "response code {} ({})", status, url);
        return Outcome::Rejected(status);
    }

    let limit = (max_size > 0).then_some(max_size);
    if let (Some(limit), Some(length)) = (limit, response.content_length()) {
        if length > limit {
            tracing::error!(target: TARGET, "response of {} bytes exceeds limit {} ({})", length, limit, url);
            return Outcome::Rejected(HTTP_BAD_GATEWAY);
        }
    }

    let status_line = format!("{:?} {}\r\n", response.version(), response.status());
    let head = status_line.len() as u64 + header_bytes(response.headers()) + 2;

    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                body.extend_from_slice(&chunk);
                if let Some(limit) = limit {
                    if body.len() as u64 > limit {
                        tracing::error!(target: TARGET, "response exceeds limit {} ({})", limit, url);
                        return Outcome::Rejected(HTTP_BAD_GATEWAY);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(target: TARGET, "{} ({})", e, url);
                return Outcome::Rejected(HTTP_BAD_GATEWAY);
            }
        }
    }

    Outcome::Success {
        download: head + body.len() as u64,
        upload,
        body,
    }
}

impl Requests for HttpRequests {
    fn get(&self, url: &str, on_response: OnResponse, on_reject: Option<OnReject>, max_size: u64) {
        self.submit(PendingRequest {
            method: Method::Get,
            url: url.to_string(),
            body: None,
            max_size,
            on_response,
            on_reject,
        });
    }

    fn post(
        &self,
        url: &str,
        body: &str,
        on_response: OnResponse,
        on_reject: Option<OnReject>,
        max_size: u64,
    ) {
        self.submit(PendingRequest {
            method: Method::Post,
            url: url.to_string(),
            body: Some(body.to_string()),
            max_size,
            on_response,
            on_reject,
        });
    }

    fn update(&self) {
        while let Ok(outcome) = self.completed_rx.try_recv() {
            let Some(finished) = self.queue.lock().in_flight.take() else {
                continue;
            };
            match outcome {
                Outcome::Success {
                    body,
                    upload,
                    download,
                } => {
                    self.total_upload.fetch_add(upload, Ordering::Relaxed);
                    self.total_download.fetch_add(download, Ordering::Relaxed);
                    tracing::debug!(target: TARGET, "{} bytes from {}", body.len(), finished.url);
                    (finished.on_response)(body);
                }
                Outcome::Rejected(status) => {
                    if let Some(on_reject) = finished.on_reject {
                        on_reject(status);
                    }
                }
            }
        }
        self.start_next();
    }

    fn total_upload(&self) -> u64 {
        self.total_upload.load(Ordering::Relaxed)
    }

    fn total_download(&self) -> u64 {
        self.total_download.load(Ordering::Relaxed)
    }
}

impl Drop for HttpRequests {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for HttpRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequests")
            .field("busy", &self.is_busy())
            .field("pending", &self.pending_count())
            .field("total_upload", &self.total_upload())
            .field("total_download", &self.total_download())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = RequestSettings::default();
        assert_eq!(settings.user_agent, "curl/7.81.0");
        assert_eq!(settings.timeout, None);
        assert!(!settings.follow_redirects);
    }

    #[test]
    fn test_settings_builder() {
        let settings = RequestSettings::new()
            .user_agent("game/1.0")
            .timeout(Duration::from_secs(5))
            .follow_redirects(true);
        assert_eq!(settings.user_agent, "game/1.0");
        assert_eq!(settings.timeout, Some(Duration::from_secs(5)));
        assert!(settings.follow_redirects);
    }

    #[test]
    fn test_post_request_carries_json_body() {
        let client = reqwest::Client::new();
        let pending = PendingRequest {
            method: Method::Post,
            url: "http://localhost:1/submit".to_string(),
            body: Some(r#"{"score":10}"#.to_string()),
            max_size: 0,
            on_response: Box::new(|_: Vec<u8>| {}),
            on_reject: None,
        };

        let request = build_request(&client, &pending).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, br#"{"score":10}"#);
        assert!(request_bytes(&request) > body.len() as u64);
    }

    #[test]
    fn test_invalid_url_is_rejected_synchronously() {
        let requests = HttpRequests::new(RequestSettings::default()).unwrap();
        let rejected = std::sync::Arc::new(Mutex::new(None));
        let sink = rejected.clone();

        requests.get(
            "not a url",
            Box::new(|_: Vec<u8>| panic!("unexpected response")),
            Some(Box::new(move |status: u16| *sink.lock() = Some(status))),
            0,
        );

        assert_eq!(*rejected.lock(), Some(HTTP_BAD_GATEWAY));
        assert!(!requests.is_busy());
    }
}
