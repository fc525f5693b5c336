//! Upstream BigModel provider adapters.
//!
//! Every provider is reached the same way: an HTTP POST whose response is a
//! line-oriented stream of small JSON objects. This crate holds the parts that
//! differ per provider, behind the [`ProviderAdapter`] trait, and the shared
//! [`Transport`] that opens the stream.
//!
//! # Chat Providers
//!
//! - **GLM** - [`chat::GlmAdapter`]
//! - **LLaMA** - [`chat::LlamaAdapter`]
//!
//! # Image Providers
//!
//! - **Text-to-image** - [`image::TextToImageAdapter`]; results are links, not text
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use bigmodel_providers::{AdapterRegistry, GenerationRequest, HttpTransport, TaskType,
//!     Transport, TransportConfig};
//! use bigmodel_providers::framing::LineDecoder;
//! use futures::StreamExt;
//!
//! let registry = AdapterRegistry::with_defaults();
//! let adapter = registry.get(TaskType::Glm).unwrap();
//! let body = adapter.build_request(&GenerationRequest::new(TaskType::Glm, "What is Rust?"))?;
//!
//! let transport = HttpTransport::new(TransportConfig::default())?;
//! let mut stream = transport.open("http://10.0.0.1:8080/glm", &body).await?;
//! let mut decoder = LineDecoder::new();
//! while let Some(bytes) = stream.next().await {
//!     for line in decoder.push(&bytes?) {
//!         if let Some(chunk) = adapter.parse_chunk(&line) {
//!             print!("{}", chunk.text);
//!         }
//!     }
//! }
//! ```

pub mod adapter;
pub mod chat;
pub mod config;
pub mod error;
pub mod framing;
pub mod image;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use adapter::{
    Chunk, GenerationParams, GenerationRequest, HistoryTurn, ProviderAdapter, TaskType,
};
pub use config::TransportConfig;
pub use error::{ProviderError, Result};
pub use registry::AdapterRegistry;
pub use transport::{ByteStream, HttpTransport, Transport};
