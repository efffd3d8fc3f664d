//! HTTP vocabulary shared by the codec, the processor and the interceptor,
//! plus the [`Transport`] seam that real and scripted clients implement.

use std::time::Instant;
use thiserror::Error;

/// Largest request body the codec will capture.
pub const MAX_REQUEST_BODY_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_HEADERS_COUNT: usize = 100;

/// Ordered header list. Names are matched case-insensitively, duplicates are
/// kept and the original order survives a store round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders(Vec<(String, String)>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity.min(MAX_HEADERS_COUNT)))
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Drops earlier values of `name` before appending.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }

    /// Response headers are copied lossily: a non-UTF-8 value must not fail
    /// an otherwise good exchange.
    pub fn from_header_map(map: &reqwest::header::HeaderMap) -> Self {
        let mut headers = Self::with_capacity(map.len());
        for (name, value) in map {
            headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        headers
    }
}

impl From<Vec<(String, String)>> for HttpHeaders {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

/// Methods the queue is willing to store and replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Head,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Case-insensitive; `None` for anything outside [`ALL`](Self::ALL).
    pub fn parse(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|known| known.as_str().eq_ignore_ascii_case(method))
    }

    /// GET and HEAD bodies are never captured or replayed.
    pub fn may_carry_body(self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Response body kinds the payload decoder distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    Json,
    /// Lower-cased essence, e.g. `image/png`.
    Image(String),
    Other(String),
}

impl ContentType {
    pub fn from_header(value: &str) -> Self {
        let essence = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == "application/json" || essence.ends_with("+json") {
            ContentType::Json
        } else if essence.starts_with("image/") {
            ContentType::Image(essence)
        } else {
            ContentType::Other(essence)
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout talking to {host}")]
    Timeout { host: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl HttpError {
    /// Failure for a non-2xx answer. The body excerpt is capped at 200 chars.
    pub fn status(response: &HttpResponse) -> Self {
        HttpError::HttpStatus {
            status: response.status(),
            message: String::from_utf8_lossy(response.body())
                .chars()
                .take(200)
                .collect(),
        }
    }

    fn from_reqwest(host: &str, err: &reqwest::Error) -> Self {
        let host = host.to_string();
        if err.is_timeout() {
            HttpError::Timeout { host }
        } else if err.is_connect() {
            HttpError::ConnectionError {
                host,
                message: err.to_string(),
            }
        } else if err.is_builder() {
            HttpError::InvalidRequest {
                reason: err.to_string(),
            }
        } else {
            HttpError::Transport {
                message: err.to_string(),
            }
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    duration_ms: u64,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>, duration_ms: u64) -> Self {
        Self {
            status,
            headers,
            body,
            duration_ms,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.header("content-type").map(ContentType::from_header)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

/// The outbound side of the worker. Non-2xx answers are returned as
/// responses; only failures to complete the exchange are errors.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: reqwest::Request) -> Result<HttpResponse, HttpError> {
        let host = request.url().host_str().unwrap_or_default().to_string();
        let started = Instant::now();

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| HttpError::from_reqwest(&host, &e))?;
        let status = response.status().as_u16();
        let headers = HttpHeaders::from_header_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(&host, &e))?
            .to_vec();

        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(HttpResponse::new(status, headers, body, elapsed))
    }
}
