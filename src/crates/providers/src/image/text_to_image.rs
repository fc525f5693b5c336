//! Text-to-image adapter.
//!
//! Generation is slow and produces no text, so the endpoint streams progress
//! lines and finishes with a line carrying the generated pictures:
//!
//! ```text
//! data: {"status": 200, "progress": "step 5/20"}
//! data: {"status": 200, "pictures": {"1": "https://.../1.png"}, "finished": true}
//! ```

use crate::adapter::{Chunk, GenerationRequest, ProviderAdapter, TaskType};
use crate::error::{ProviderError, Result};
use crate::framing::decode_line;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest description the image models accept, in characters.
pub const MAX_DESC_CHARS: usize = 75;

/// Adapter for text-to-image endpoints.
#[derive(Debug, Clone, Default)]
pub struct TextToImageAdapter {
    styles: Vec<String>,
}

impl TextToImageAdapter {
    /// Adapter accepting any non-empty style.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict accepted styles.
    pub fn with_styles<I, S>(mut self, styles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.styles = styles.into_iter().map(Into::into).collect();
        self
    }
}

impl ProviderAdapter for TextToImageAdapter {
    fn task_type(&self) -> TaskType {
        TaskType::TextToImage
    }

    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        let desc_len = request.desc.trim().chars().count();
        if desc_len == 0 {
            return Err(ProviderError::InvalidRequest("desc must not be empty".to_string()));
        }
        if desc_len > MAX_DESC_CHARS {
            return Err(ProviderError::InvalidRequest(format!(
                "desc is {} characters, at most {} allowed",
                desc_len, MAX_DESC_CHARS
            )));
        }
        if request.style.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("style is required".to_string()));
        }
        if !self.styles.is_empty() && !self.styles.iter().any(|s| s == request.style.trim()) {
            return Err(ProviderError::InvalidRequest(format!(
                "unsupported style: {}",
                request.style
            )));
        }
        Ok(())
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let body = ImageRequest {
            desc: request.desc.trim(),
            style: request.style.trim(),
        };
        Ok(serde_json::to_value(body)?)
    }

    fn parse_chunk(&self, line: &str) -> Option<Chunk> {
        let raw: ImageChunk = decode_line(line)?;
        if let Some(progress) = raw.progress.as_deref() {
            tracing::trace!(progress, "Image generation progress");
        }
        Some(Chunk {
            text: String::new(),
            status: raw.status,
            finished: raw.finished,
            links: raw.pictures,
            message: raw.msg,
        })
    }

    fn is_terminal(&self, chunk: &Chunk) -> bool {
        chunk.finished || !chunk.links.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    desc: &'a str,
    style: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageChunk {
    #[serde(default = "ok_status")]
    status: u16,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    pictures: BTreeMap<String, String>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    msg: Option<String>,
}

fn ok_status() -> u16 {
    200
}
