//! VLM Core - multimodal conversational runtime
//!
//! This crate keeps bounded, per-session conversation state (text, images and
//! audio), renders it into the Gemma chat-turn grammar and drives a model
//! through batch or streaming generation with load retries and deadlines.
//!
//! # Architecture
//!
//! - [`media`]: image decoding/downscaling and audio transcoding
//! - [`conversation`]: turn storage with eviction and media release
//! - [`prompt`]: turn rendering and named system templates
//! - [`model`]: capability traits and the load lifecycle
//! - [`runtime`]: the [`VlmService`] request orchestrator
//! - [`backends`]: candle implementations of the model traits
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vlm_core::{backends::Gemma3Loader, EngineConfig, GenerationRequest, VlmService};
//!
//! let config = EngineConfig::default();
//! let loader = Arc::new(Gemma3Loader::new(config.models_dir.clone(), config.use_metal));
//! let service = VlmService::new(config, loader);
//!
//! let output = service.generate(GenerationRequest::new("Hello!")).await?;
//! println!("{}", output.text);
//! ```

pub mod backends;
pub mod config;
pub mod conversation;
pub mod error;
pub mod media;
pub mod model;
pub mod prompt;
pub mod runtime;

pub use config::{EngineConfig, ServerConfig};
pub use conversation::{ChatRole, ContentDescriptor, ConversationStore, TurnSnapshot};
pub use error::{Error, Result};
pub use model::{LoadState, LoadStatus, LoadedModel, ModelLoader, SamplingParams};
pub use prompt::{PromptRegistry, PromptTemplate};
pub use runtime::{
    ConversationHistory, GenerationMetadata, GenerationOutput, GenerationRequest, HealthReport,
    HealthStatus, TokenStream, VlmService, DEFAULT_SESSION, DONE_SENTINEL, ERROR_MARKER,
};
