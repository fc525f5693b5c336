//! Conversational model adapters.
//!
//! # Providers
//!
//! - **GLM** - reply fragments with an explicit `finished` flag
//! - **LLaMA** - one token per line, final line carries the whole text

pub mod glm;
pub mod llama;

pub use glm::GlmAdapter;
pub use llama::LlamaAdapter;
