//! The provider capability set.
//!
//! Every upstream model family speaks the same transport (an HTTP POST that
//! answers with a line-oriented stream) but differs in request shape and chunk
//! layout. Those differences are isolated behind [`ProviderAdapter`]; pooling,
//! retry and moderation interleaving are shared by the engine.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Provider/model family a task is executed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// GLM-style conversational model
    Glm,
    /// LLaMA-style conversational model
    Llama,
    /// Text-to-image generation; results are picture links
    TextToImage,
}

impl TaskType {
    /// All known families.
    pub const ALL: [TaskType; 3] = [TaskType::Glm, TaskType::Llama, TaskType::TextToImage];

    /// Stable string form used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Glm => "glm",
            TaskType::Llama => "llama",
            TaskType::TextToImage => "text_to_image",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "glm" => Ok(TaskType::Glm),
            "llama" => Ok(TaskType::Llama),
            "text_to_image" => Ok(TaskType::TextToImage),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

/// One earlier question/answer exchange in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub question: String,
    pub answer: String,
}

/// Sampling and penalty knobs forwarded to the provider.
///
/// Every field is optional so that a stored task written by an older version
/// still decodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,

    /// Sample instead of greedy decoding
    #[serde(default)]
    pub sampling: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryTurn>,
}

impl GenerationParams {
    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set nucleus sampling probability.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Enable sampling.
    pub fn with_sampling(mut self, sampling: bool) -> Self {
        self.sampling = sampling;
        self
    }

    /// Append a history turn.
    pub fn with_history(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.history.push(HistoryTurn {
            question: question.into(),
            answer: answer.into(),
        });
        self
    }

    /// Characters of conversational input, including history.
    pub fn history_len(&self) -> usize {
        self.history
            .iter()
            .map(|t| t.question.chars().count() + t.answer.chars().count())
            .sum()
    }
}

/// Provider-independent description of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task_type: TaskType,
    pub style: String,
    pub desc: String,
    #[serde(default)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Create a request with default parameters.
    pub fn new(task_type: TaskType, desc: impl Into<String>) -> Self {
        Self {
            task_type,
            style: String::new(),
            desc: desc.into(),
            params: GenerationParams::default(),
        }
    }

    /// Set the style.
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    /// Set generation parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Input size used by pool routing.
    pub fn input_len(&self) -> usize {
        self.desc.chars().count() + self.params.history_len()
    }
}

/// A decoded line of an upstream response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    /// Reply fragment; may be empty for progress-only lines.
    pub text: String,

    /// Provider status code carried in the chunk.
    pub status: u16,

    /// Explicit completion marker reported by the provider.
    pub finished: bool,

    /// Result links (name → URL), only present on terminal image chunks.
    pub links: BTreeMap<String, String>,

    /// Provider-supplied message explaining a non-success status.
    pub message: Option<String>,
}

impl Chunk {
    /// A successful text chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: 200,
            ..Default::default()
        }
    }

    /// Mark this chunk as the provider's final one.
    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Request building and response decoding for one provider family.
pub trait ProviderAdapter: Send + Sync + fmt::Debug {
    /// Family handled by this adapter.
    fn task_type(&self) -> TaskType;

    /// Reject requests this provider cannot serve.
    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        let _ = request;
        Ok(())
    }

    /// Build the JSON body of the outbound call.
    fn build_request(&self, request: &GenerationRequest) -> Result<serde_json::Value>;

    /// Decode one line of the response. `None` means the line is not a chunk
    /// (blank, keep-alive, or garbage) and should be skipped.
    fn parse_chunk(&self, line: &str) -> Option<Chunk>;

    /// Whether `chunk` ends the stream.
    fn is_terminal(&self, chunk: &Chunk) -> bool {
        chunk.finished
    }

    /// Whether `chunk` reports success.
    fn is_success(&self, chunk: &Chunk) -> bool {
        chunk.status == 200
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trip_str() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>().unwrap(), task_type);
        }
        assert!("gpt".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_task_type_serde_matches_as_str() {
        let json = serde_json::to_string(&TaskType::TextToImage).unwrap();
        assert_eq!(json, "\"text_to_image\"");
    }

    #[test]
    fn test_input_len_counts_history() {
        let request = GenerationRequest::new(TaskType::Glm, "hello")
            .with_params(GenerationParams::default().with_history("ab", "cde"));
        assert_eq!(request.input_len(), 10);
    }

    #[test]
    fn test_params_decode_missing_fields() {
        let params: GenerationParams = serde_json::from_str(r#"{"top_k": 5}"#).unwrap();
        assert_eq!(params.top_k, Some(5));
        assert!(!params.sampling);
        assert!(params.history.is_empty());
    }
}
