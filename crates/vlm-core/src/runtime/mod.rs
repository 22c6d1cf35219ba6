//! Generation orchestration.
//!
//! [`VlmService`] is the request lifecycle entry point: it validates requests,
//! keeps per-session conversation state, drives the model lifecycle and runs
//! batch or streaming generation with deadlines.

mod generate;
mod service;
mod stream;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use service::VlmService;
pub use stream::TokenStream;
pub use types::{
    ConversationHistory, GenerationMetadata, GenerationOutput, GenerationRequest, HealthReport,
    HealthStatus, DEFAULT_SESSION, DONE_SENTINEL, ERROR_MARKER, MAX_TOKENS_LIMIT,
};
