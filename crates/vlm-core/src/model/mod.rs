//! Model capability traits and the load lifecycle around them.
//!
//! Inference engines plug in through [`ModelLoader`] and [`LoadedModel`]. Both
//! are synchronous; the runtime always calls them from the blocking pool.

mod lifecycle;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SamplingDefaults;
use crate::conversation::ActiveMedia;
use crate::error::Result;

pub use lifecycle::{LoadState, LoadStatus, ModelHandle, ModelLifecycle};

/// Sampling parameters forwarded to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl From<&SamplingDefaults> for SamplingParams {
    fn from(defaults: &SamplingDefaults) -> Self {
        Self {
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            top_k: defaults.top_k,
            top_p: defaults.top_p,
        }
    }
}

/// Produces a ready-to-use model from an identifier (hub id or local path).
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn LoadedModel>>;
}

/// A loaded model together with its processor/tokenizer.
pub trait LoadedModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Final prompt preparation given the rendered conversation and the number
    /// of attached media items.
    fn apply_chat_template(
        &self,
        conversation: &str,
        num_images: usize,
        num_audios: usize,
    ) -> Result<String>;

    fn generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
    ) -> Result<String>;

    /// Emit text fragments as they are produced. Generation stops early once
    /// `on_token` returns `false`.
    fn stream_generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()>;
}
