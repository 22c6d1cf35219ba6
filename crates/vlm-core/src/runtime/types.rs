//! Runtime request/response types.

use serde::Serialize;

use crate::conversation::TurnSnapshot;
use crate::model::LoadState;

/// Session used when a request does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Upper bound accepted for `max_tokens`.
pub const MAX_TOKENS_LIMIT: usize = 4096;

/// In-band prefix of a streamed error token.
pub const ERROR_MARKER: &str = "Error: ";

/// Final item of every token stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A single generation request. Unset sampling fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub prompt_template: Option<String>,
    pub image: Option<Vec<u8>>,
    pub audio: Option<Vec<u8>>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub session_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.image = Some(bytes);
        self
    }

    pub fn with_audio(mut self, bytes: Vec<u8>) -> Self {
        self.audio = Some(bytes);
        self
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.prompt_template = Some(name.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_SESSION)
    }

    pub fn has_media(&self) -> bool {
        self.image.is_some() || self.audio.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetadata {
    pub model: String,
    pub num_images: usize,
    pub num_audios: usize,
    pub conversation_length: usize,
    pub generation_time_ms: f64,
    pub response_length: usize,
}

/// Completed batch generation
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    /// The user prompt as submitted
    pub prompt: String,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub state: LoadState,
    pub loaded: bool,
    pub model_name: Option<String>,
    pub last_error: Option<String>,
    pub load_attempts: u64,
    pub consecutive_failures: u32,
    /// Turns in the default session
    pub conversation_length: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationHistory {
    pub conversation_history: Vec<TurnSnapshot>,
    pub length: usize,
    pub max_length: usize,
}
