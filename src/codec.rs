//! Conversion between a live `reqwest::Request` and the owned form kept in
//! the queue.
//!
//! Serialization must happen before the request is handed to a transport:
//! sending consumes the request, and only a buffered body can be copied.

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

use crate::capabilities::http::{HttpHeaders, HttpMethod, MAX_HEADERS_COUNT, MAX_REQUEST_BODY_SIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("request body is a stream and cannot be captured")]
    UnreadableBody,

    #[error("request body too large: {size} bytes, max {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("too many headers: {count}, max {max}")]
    TooManyHeaders { count: usize, max: usize },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header {name}")]
    InvalidHeader { name: String },
}

/// Storable snapshot of an outbound request.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SerializedRequest {
    pub method: String,
    pub url: String,
    /// Ordered name/value pairs, duplicates kept.
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes")]
    pub body: Option<Vec<u8>>,
}

impl SerializedRequest {
    pub fn headers(&self) -> HttpHeaders {
        HttpHeaders::from(self.headers.clone())
    }
}

impl fmt::Debug for SerializedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field(
                "header_names",
                &self.headers.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .finish()
    }
}

pub fn serialize(request: &reqwest::Request) -> Result<SerializedRequest, CodecError> {
    let method = HttpMethod::parse(request.method().as_str())
        .ok_or_else(|| CodecError::UnsupportedMethod(request.method().to_string()))?;

    if request.headers().len() > MAX_HEADERS_COUNT {
        return Err(CodecError::TooManyHeaders {
            count: request.headers().len(),
            max: MAX_HEADERS_COUNT,
        });
    }

    let mut headers = HttpHeaders::with_capacity(request.headers().len());
    for (name, value) in request.headers() {
        let value = value.to_str().map_err(|_| CodecError::InvalidHeader {
            name: name.to_string(),
        })?;
        headers.append(name.as_str(), value);
    }

    let body = if method.may_carry_body() {
        match request.body() {
            None => None,
            Some(body) => {
                let bytes = body.as_bytes().ok_or(CodecError::UnreadableBody)?;
                if bytes.len() > MAX_REQUEST_BODY_SIZE {
                    return Err(CodecError::BodyTooLarge {
                        size: bytes.len(),
                        max: MAX_REQUEST_BODY_SIZE,
                    });
                }
                Some(bytes.to_vec())
            }
        }
    } else {
        None
    };

    Ok(SerializedRequest {
        method: method.as_str().to_string(),
        url: request.url().to_string(),
        headers: headers.into_vec(),
        body,
    })
}

/// Rebuilds a sendable request. The stored body is cloned so the queue entry
/// stays usable for the next attempt.
pub fn deserialize(serialized: &SerializedRequest) -> Result<reqwest::Request, CodecError> {
    let method = HttpMethod::parse(&serialized.method)
        .ok_or_else(|| CodecError::UnsupportedMethod(serialized.method.clone()))?;

    let url = Url::parse(&serialized.url).map_err(|e| CodecError::InvalidUrl {
        url: serialized.url.clone(),
        reason: e.to_string(),
    })?;

    let mut request = reqwest::Request::new(method.to_reqwest(), url);

    for (name, value) in &serialized.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CodecError::InvalidHeader { name: name.clone() })?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| CodecError::InvalidHeader { name: name.clone() })?;
        request.headers_mut().append(header_name, header_value);
    }

    if method.may_carry_body() {
        if let Some(body) = &serialized.body {
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));
        }
    }

    Ok(request)
}
