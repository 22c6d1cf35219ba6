//! Configuration types for the VLM service.
//!
//! Every field has a serde default so partial JSON files are accepted, and the
//! defaults themselves honour the environment variables the service has always
//! read (`VLM_MODEL`, `MAX_CONVERSATION_LENGTH`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hugging Face model id or local model directory
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Directory used as the Hugging Face download cache
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Enable Metal GPU acceleration
    #[serde(default = "default_use_metal")]
    pub use_metal: bool,

    /// Maximum number of turns kept per conversation
    #[serde(default = "default_max_conversation_length")]
    pub max_conversation_length: usize,

    /// Maximum prompt length in characters
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub sampling: SamplingDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            models_dir: default_models_dir(),
            use_metal: default_use_metal(),
            max_conversation_length: default_max_conversation_length(),
            max_prompt_length: default_max_prompt_length(),
            media: MediaConfig::default(),
            load: LoadConfig::default(),
            timeouts: TimeoutConfig::default(),
            sampling: SamplingDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::ConfigError(format!("Invalid config file {}: {e}", path.display()))
        })
    }
}

/// Limits applied by the media normalizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,

    /// Hard cap for either image side after downscaling
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,

    /// Transcoder executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_transcode_timeout", with = "duration_secs")]
    pub transcode_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            max_audio_bytes: default_max_audio_bytes(),
            max_image_dimension: default_max_image_dimension(),
            ffmpeg_path: default_ffmpeg_path(),
            transcode_timeout: default_transcode_timeout(),
        }
    }
}

/// Model load retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Attempts per load cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay between attempts, and the backoff window between cycles
    #[serde(default = "default_retry_delay", with = "duration_secs")]
    pub retry_delay: Duration,

    #[serde(default = "default_load_timeout", with = "duration_secs")]
    pub load_timeout: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            load_timeout: default_load_timeout(),
        }
    }
}

/// Generation deadlines. Audio requests get the longer variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_total_timeout", with = "duration_secs")]
    pub total: Duration,

    #[serde(default = "default_total_timeout_audio", with = "duration_secs")]
    pub total_with_audio: Duration,

    /// Maximum gap between two streamed tokens
    #[serde(default = "default_token_timeout", with = "duration_secs")]
    pub per_token: Duration,

    #[serde(default = "default_token_timeout_audio", with = "duration_secs")]
    pub per_token_with_audio: Duration,
}

impl TimeoutConfig {
    pub fn total_for(&self, has_audio: bool) -> Duration {
        if has_audio {
            self.total_with_audio
        } else {
            self.total
        }
    }

    pub fn per_token_for(&self, has_audio: bool) -> Duration {
        if has_audio {
            self.per_token_with_audio
        } else {
            self.per_token
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            total: default_total_timeout(),
            total_with_audio: default_total_timeout_audio(),
            per_token: default_token_timeout(),
            per_token_with_audio: default_token_timeout_audio(),
        }
    }
}

/// Sampling values used when a request leaves them unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn env_value<T: FromStr>(keys: &[&str]) -> Option<T> {
    keys.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .and_then(|raw| raw.trim().parse::<T>().ok())
    })
}

fn default_model_id() -> String {
    std::env::var("VLM_MODEL")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| "google/gemma-3-1b-it".to_string())
}

fn default_models_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("VLM_MODELS_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vlm")
        .join("models")
}

fn default_use_metal() -> bool {
    env_value(&["VLM_USE_METAL"]).unwrap_or(cfg!(target_os = "macos"))
}

fn default_max_conversation_length() -> usize {
    env_value(&["MAX_CONVERSATION_LENGTH"]).unwrap_or(10)
}

fn default_max_prompt_length() -> usize {
    env_value(&["MAX_PROMPT_LENGTH"]).unwrap_or(50_000)
}

fn default_max_image_bytes() -> usize {
    env_value::<usize>(&["MAX_IMAGE_SIZE_MB"]).unwrap_or(50) * 1024 * 1024
}

fn default_max_audio_bytes() -> usize {
    env_value::<usize>(&["MAX_AUDIO_SIZE_MB"]).unwrap_or(10) * 1024 * 1024
}

fn default_max_image_dimension() -> u32 {
    512
}

fn default_ffmpeg_path() -> PathBuf {
    std::env::var("VLM_FFMPEG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ffmpeg"))
}

fn default_transcode_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> usize {
    env_value(&["VLM_RETRY_ATTEMPTS"]).unwrap_or(3)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(env_value(&["VLM_RETRY_DELAY"]).unwrap_or(5))
}

fn default_load_timeout() -> Duration {
    Duration::from_secs(env_value(&["VLM_LOAD_TIMEOUT"]).unwrap_or(120))
}

fn default_total_timeout() -> Duration {
    Duration::from_secs(env_value(&["VLM_TIMEOUT"]).unwrap_or(300))
}

fn default_total_timeout_audio() -> Duration {
    Duration::from_secs(600)
}

fn default_token_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_token_timeout_audio() -> Duration {
    Duration::from_secs(60)
}

fn default_max_tokens() -> usize {
    env_value(&["VLM_MAX_TOKENS"]).unwrap_or(512)
}

fn default_temperature() -> f32 {
    env_value(&["VLM_TEMPERATURE"]).unwrap_or(1.0)
}

fn default_top_k() -> usize {
    env_value(&["VLM_TOP_K"]).unwrap_or(64)
}

fn default_top_p() -> f32 {
    env_value(&["VLM_TOP_P"]).unwrap_or(0.95)
}

fn default_host() -> String {
    std::env::var("VLM_HOST")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    env_value(&["VLM_PORT", "PORT"]).unwrap_or(8000)
}

fn default_cors_origins() -> Vec<String> {
    match std::env::var("CORS_ORIGINS") {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect(),
        _ => vec!["*".to_string()],
    }
}

fn default_max_concurrent_requests() -> usize {
    env_value(&["MAX_CONCURRENT_REQUESTS"]).unwrap_or(100)
}

/// Serde adapter storing a `Duration` as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_conversation_length": 4, "load": {"retry_delay": 0.5}}"#,
        )
        .unwrap();

        assert_eq!(config.max_conversation_length, 4);
        assert_eq!(config.load.retry_delay, Duration::from_millis(500));
        assert_eq!(config.media.max_image_dimension, 512);
        assert_eq!(config.timeouts.total_with_audio, Duration::from_secs(600));
    }

    #[test]
    fn audio_requests_get_longer_deadlines() {
        let timeouts = TimeoutConfig::default();
        assert!(timeouts.total_for(true) > timeouts.total_for(false));
        assert!(timeouts.per_token_for(true) > timeouts.per_token_for(false));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let err = serde_json::from_str::<LoadConfig>(r#"{"load_timeout": -1}"#);
        assert!(err.is_err());
    }
}
