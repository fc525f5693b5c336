//! LLaMA adapter.
//!
//! The endpoint streams one token per line, `data:{"token":{"text":"..."},"status":200}`,
//! and the final line additionally carries `generated_text` with the full reply.

use crate::adapter::{Chunk, GenerationRequest, ProviderAdapter, TaskType};
use crate::error::{ProviderError, Result};
use crate::framing::decode_line;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_NEW_TOKENS: u32 = 512;

/// Adapter for LLaMA-style chat endpoints.
#[derive(Debug, Clone)]
pub struct LlamaAdapter {
    max_new_tokens: u32,
}

impl Default for LlamaAdapter {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl LlamaAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token budget used when the request does not set one.
    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
}

impl ProviderAdapter for LlamaAdapter {
    fn task_type(&self) -> TaskType {
        TaskType::Llama
    }

    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        if request.desc.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("prompt must not be empty".to_string()));
        }
        Ok(())
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let params = &request.params;
        let mut history = Vec::with_capacity(params.history.len() * 2);
        for turn in &params.history {
            history.push(LlamaMessage {
                role: "user",
                content: &turn.question,
            });
            history.push(LlamaMessage {
                role: "assistant",
                content: &turn.answer,
            });
        }

        let body = LlamaRequest {
            prompt: &request.desc,
            history,
            max_new_tokens: params.max_new_tokens.unwrap_or(self.max_new_tokens),
            do_sample: params.sampling,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repetition_penalty: params.repetition_penalty,
            stream: true,
        };
        Ok(serde_json::to_value(body)?)
    }

    fn parse_chunk(&self, line: &str) -> Option<Chunk> {
        let raw: LlamaChunk = decode_line(line)?;
        Some(Chunk {
            text: raw.token.map(|t| t.text).unwrap_or_default(),
            status: raw.status,
            finished: raw.generated_text.is_some(),
            links: Default::default(),
            message: raw.error,
        })
    }
}

#[derive(Debug, Serialize)]
struct LlamaRequest<'a> {
    prompt: &'a str,
    history: Vec<LlamaMessage<'a>>,
    max_new_tokens: u32,
    do_sample: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct LlamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct LlamaChunk {
    #[serde(default)]
    token: Option<LlamaToken>,
    #[serde(default = "ok_status")]
    status: u16,
    #[serde(default)]
    generated_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlamaToken {
    #[serde(default)]
    text: String,
}

fn ok_status() -> u16 {
    200
}
