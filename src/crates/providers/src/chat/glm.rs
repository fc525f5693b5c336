//! GLM adapter.
//!
//! Request:
//!
//! ```json
//! {"inputs": "...", "history": [["q", "a"]], "stream": true,
//!  "parameters": {"sampling": true, "top_p": 0.8, "temperature": 0.9}}
//! ```
//!
//! Each response line is `data: {"reply": "...", "status": 200, "finished": false}`.

use crate::adapter::{Chunk, GenerationRequest, ProviderAdapter, TaskType};
use crate::error::{ProviderError, Result};
use crate::framing::decode_line;
use serde::{Deserialize, Serialize};

/// Adapter for GLM-style chat endpoints.
#[derive(Debug, Clone, Default)]
pub struct GlmAdapter;

impl GlmAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderAdapter for GlmAdapter {
    fn task_type(&self) -> TaskType {
        TaskType::Glm
    }

    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        if request.desc.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("inputs must not be empty".to_string()));
        }
        Ok(())
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let params = &request.params;
        let body = GlmRequest {
            inputs: &request.desc,
            history: params
                .history
                .iter()
                .map(|t| [t.question.as_str(), t.answer.as_str()])
                .collect(),
            parameters: GlmParameters {
                sampling: params.sampling,
                top_p: params.top_p,
                top_k: params.top_k,
                temperature: params.temperature,
                repetition_penalty: params.repetition_penalty,
                max_new_tokens: params.max_new_tokens,
            },
            stream: true,
        };
        Ok(serde_json::to_value(body)?)
    }

    fn parse_chunk(&self, line: &str) -> Option<Chunk> {
        let raw: GlmChunk = decode_line(line)?;
        Some(Chunk {
            text: raw.reply,
            status: raw.status,
            finished: raw.finished,
            links: Default::default(),
            message: raw.msg,
        })
    }
}

#[derive(Debug, Serialize)]
struct GlmRequest<'a> {
    inputs: &'a str,
    history: Vec<[&'a str; 2]>,
    parameters: GlmParameters,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GlmParameters {
    sampling: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GlmChunk {
    #[serde(default)]
    reply: String,
    #[serde(default = "ok_status")]
    status: u16,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    msg: Option<String>,
}

fn ok_status() -> u16 {
    200
}
