//! Prompt construction: chat-turn rendering and the system template registry.

mod formatter;
mod registry;

pub use formatter::{render, render_turns};
pub use registry::{PromptRegistry, PromptTemplate, PromptUpdate, SamplingPolicy, DEFAULT_TEMPLATE};
