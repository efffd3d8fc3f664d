//! Client side of the remote `POST /edit-image` endpoint.
//!
//! The form is encoded into an in-memory buffer rather than a streaming
//! multipart body, so the codec can capture it if the first attempt fails.

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const FALLBACK_PROMPT: &str = "Enhance this image appropriately.";
pub const DEFAULT_INFERENCE_STEPS: u32 = 50;
pub const DEFAULT_TRUE_CFG_SCALE: f32 = 4.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EditError {
    #[error("image part is empty")]
    EmptyImage,

    #[error("base URL cannot carry a path: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EditType {
    RemoveBg,
    ReplaceBgAuto,
    ReplaceBgCustom,
    Enhance,
    Colorize,
}

impl EditType {
    pub const ALL: [EditType; 5] = [
        EditType::RemoveBg,
        EditType::ReplaceBgAuto,
        EditType::ReplaceBgCustom,
        EditType::Enhance,
        EditType::Colorize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EditType::RemoveBg => "remove_bg",
            EditType::ReplaceBgAuto => "replace_bg_auto",
            EditType::ReplaceBgCustom => "replace_bg_custom",
            EditType::Enhance => "enhance",
            EditType::Colorize => "colorize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Prompt the server applies when the request leaves it empty.
    pub fn default_prompt(self) -> &'static str {
        match self {
            EditType::RemoveBg => {
                "Remove the background from this image, keeping only the main subject with a transparent background."
            }
            EditType::ReplaceBgAuto => {
                "Replace the background with an aesthetically pleasing, contextually appropriate background."
            }
            EditType::ReplaceBgCustom => {
                "Replace the background with the reference image, ensuring seamless integration."
            }
            EditType::Enhance => {
                "Enhance the image quality, improve sharpness, color balance, and overall visual appeal."
            }
            EditType::Colorize => {
                "Adjust colors, improve contrast, and enhance visual quality while maintaining original style."
            }
        }
    }
}

impl fmt::Display for EditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt for an arbitrary `edit_type` string, falling back for unknown ones.
pub fn prompt_for(edit_type: &str) -> &'static str {
    EditType::parse(edit_type).map_or(FALLBACK_PROMPT, EditType::default_prompt)
}

#[derive(Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePart {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn png(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(filename, "image/png", bytes)
    }
}

impl fmt::Debug for ImagePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePart")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EditImageRequest {
    edit_type: EditType,
    image: ImagePart,
    reference_image: Option<ImagePart>,
    prompt: String,
    negative_prompt: String,
    num_inference_steps: u32,
    true_cfg_scale: f32,
}

impl EditImageRequest {
    pub fn new(edit_type: EditType, image: ImagePart) -> Self {
        Self {
            edit_type,
            image,
            reference_image: None,
            prompt: String::new(),
            negative_prompt: String::new(),
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
            true_cfg_scale: DEFAULT_TRUE_CFG_SCALE,
        }
    }

    pub fn reference_image(mut self, image: ImagePart) -> Self {
        self.reference_image = Some(image);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn num_inference_steps(mut self, steps: u32) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn true_cfg_scale(mut self, scale: f32) -> Self {
        self.true_cfg_scale = scale;
        self
    }

    pub fn edit_type(&self) -> EditType {
        self.edit_type
    }

    pub fn effective_prompt(&self) -> &str {
        if self.prompt.trim().is_empty() {
            self.edit_type.default_prompt()
        } else {
            &self.prompt
        }
    }

    fn validate(&self) -> Result<(), EditError> {
        if self.image.bytes.is_empty() {
            return Err(EditError::EmptyImage);
        }
        if self.num_inference_steps == 0 {
            return Err(EditError::InvalidParameter(
                "num_inference_steps must be > 0".into(),
            ));
        }
        if !self.true_cfg_scale.is_finite() || self.true_cfg_scale <= 0.0 {
            return Err(EditError::InvalidParameter(format!(
                "true_cfg_scale must be a positive number, got {}",
                self.true_cfg_scale
            )));
        }
        Ok(())
    }

    /// Builds `POST {base_url}/edit-image` with a buffered multipart body.
    pub fn into_request(self, base_url: &Url) -> Result<reqwest::Request, EditError> {
        self.validate()?;

        let mut url = base_url.clone();
        url.path_segments_mut()
            .map_err(|()| EditError::InvalidBaseUrl(base_url.to_string()))?
            .pop_if_empty()
            .push("edit-image");

        let boundary = format!("edit-queue-{}", Uuid::new_v4().simple());
        let body = self.encode_form(&boundary);

        let mut request = reqwest::Request::new(reqwest::Method::POST, url);
        let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
            .map_err(|e| EditError::InvalidParameter(e.to_string()))?;
        request.headers_mut().insert(CONTENT_TYPE, content_type);
        *request.body_mut() = Some(reqwest::Body::from(body));
        Ok(request)
    }

    fn encode_form(&self, boundary: &str) -> Vec<u8> {
        let mut form = FormWriter::new(boundary);
        form.file("image", &self.image);
        if let Some(reference) = &self.reference_image {
            form.file("reference_image", reference);
        }
        form.text("edit_type", self.edit_type.as_str());
        form.text("prompt", self.effective_prompt());
        form.text("negative_prompt", &self.negative_prompt);
        form.text("num_inference_steps", &self.num_inference_steps.to_string());
        form.text("true_cfg_scale", &self.true_cfg_scale.to_string());
        form.finish()
    }
}

struct FormWriter<'a> {
    boundary: &'a str,
    buf: Vec<u8>,
}

impl<'a> FormWriter<'a> {
    fn new(boundary: &'a str) -> Self {
        Self {
            boundary,
            buf: Vec::new(),
        }
    }

    fn text(&mut self, name: &str, value: &str) {
        self.part_header(name, None, None);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn file(&mut self, name: &str, part: &ImagePart) {
        self.part_header(name, Some(&part.filename), Some(&part.content_type));
        self.buf.extend_from_slice(&part.bytes);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn part_header(&mut self, name: &str, filename: Option<&str>, content_type: Option<&str>) {
        let mut header = format!("--{}\r\nContent-Disposition: form-data; name=\"{name}\"", self.boundary);
        if let Some(filename) = filename {
            header.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        header.push_str("\r\n");
        if let Some(content_type) = content_type {
            header.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        header.push_str("\r\n");
        self.buf.extend_from_slice(header.as_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.buf
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .map(|c| if c == '"' { "%22".to_string() } else { c.to_string() })
        .collect()
}
