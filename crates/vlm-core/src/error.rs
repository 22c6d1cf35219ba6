//! Error types for the VLM core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad caller input, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Media bytes that cannot be accepted (empty, oversized, undecodable).
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// External audio transcoder failed, timed out or is missing.
    #[error("Audio conversion failed: {0}")]
    ConversionFailed(String),

    /// Media normalization failed while servicing a generation request.
    #[error("{0}")]
    MediaProcessingFailed(String),

    /// Model is not loaded or the load backoff window is active.
    #[error("VLM service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model loading failed: {0}")]
    ModelLoadError(String),

    #[error("Failed to format prompt: {0}")]
    PromptFormattingFailed(String),

    #[error("{0}")]
    GenerationTimeout(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl Error {
    /// Short machine-readable category, used by transports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidMedia(_) | Self::ConversionFailed(_) | Self::MediaProcessingFailed(_) => {
                "media_processing_failed"
            }
            Self::ServiceUnavailable(_) | Self::ModelLoadError(_) => "service_unavailable",
            Self::PromptFormattingFailed(_) => "prompt_formatting_failed",
            Self::GenerationTimeout(_) => "generation_timeout",
            _ => "generation_failed",
        }
    }
}
