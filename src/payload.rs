use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::capabilities::http::{ContentType, HttpResponse};

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// JSON fields checked, in order, for an inline image.
const IMAGE_FIELDS: &[&str] = &["image", "edited_image", "imageBase64", "result"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),

    #[error("field {field} is not valid base64: {reason}")]
    InvalidBase64 { field: String, reason: String },
}

/// Decoded image from a successful edit. On the wire the bytes travel as
/// base64 under `data`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(into = "WireImageBlob", try_from = "WireImageBlob")]
pub struct ImageBlob {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBlob")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireImageBlob {
    mime_type: String,
    data: String,
}

impl From<ImageBlob> for WireImageBlob {
    fn from(blob: ImageBlob) -> Self {
        Self {
            mime_type: blob.mime_type,
            data: STANDARD.encode(blob.bytes),
        }
    }
}

impl TryFrom<WireImageBlob> for ImageBlob {
    type Error = base64::DecodeError;

    fn try_from(wire: WireImageBlob) -> Result<Self, Self::Error> {
        Ok(Self {
            mime_type: wire.mime_type,
            bytes: STANDARD.decode(wire.data)?,
        })
    }
}

/// Extracts the image carried by a 2xx response, if any.
///
/// A raw `image/*` body is taken as-is. A JSON body is searched for an inline
/// base64 image, either a `data:` URL or bare base64. Anything else carries
/// no image and yields `Ok(None)`.
pub fn decode_success(response: &HttpResponse) -> Result<Option<ImageBlob>, PayloadError> {
    if response.body().is_empty() {
        return Ok(None);
    }

    match response.content_type() {
        Some(ContentType::Image(mime)) => Ok(Some(ImageBlob {
            mime_type: mime,
            bytes: response.body().to_vec(),
        })),
        Some(ContentType::Json) => decode_json(response.body()),
        _ => Ok(None),
    }
}

fn decode_json(body: &[u8]) -> Result<Option<ImageBlob>, PayloadError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| PayloadError::MalformedJson(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Ok(None);
    };

    for field in IMAGE_FIELDS {
        if let Some(encoded) = object.get(*field).and_then(serde_json::Value::as_str) {
            return decode_inline(field, encoded).map(Some);
        }
    }

    Ok(None)
}

fn decode_inline(field: &str, encoded: &str) -> Result<ImageBlob, PayloadError> {
    let (mime_type, data) = match encoded.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest.split_once(',').ok_or_else(|| PayloadError::InvalidBase64 {
                field: field.to_string(),
                reason: "data URL without ','".into(),
            })?;
            let mime = meta.strip_suffix(";base64").unwrap_or(meta);
            let mime = if mime.is_empty() { DEFAULT_IMAGE_MIME } else { mime };
            (mime.to_string(), data)
        }
        None => (DEFAULT_IMAGE_MIME.to_string(), encoded),
    };

    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| PayloadError::InvalidBase64 {
            field: field.to_string(),
            reason: e.to_string(),
        })?;

    Ok(ImageBlob { mime_type, bytes })
}
