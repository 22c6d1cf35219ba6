//! Streaming generation with idle and total deadlines.
//!
//! The model runs on the blocking pool and pushes fragments through a channel.
//! The returned stream forwards them, converts deadline breaches and model
//! errors into a single in-band `"Error: ..."` item, and always finishes with
//! [`DONE_SENTINEL`]. Dropping the stream asks the producer to stop.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conversation::ChatRole;
use crate::error::{Error, Result};
use crate::runtime::service::VlmService;
use crate::runtime::types::{GenerationRequest, DONE_SENTINEL, ERROR_MARKER};

/// Finite, non-restartable sequence of response fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send>>;

enum ProducerEvent {
    Token(String),
    Finished,
    Failed(Error),
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl VlmService {
    /// Start a streaming generation. Validation, readiness, media and prompt
    /// failures are returned here; later failures arrive in-band.
    pub async fn generate_streaming(&self, request: GenerationRequest) -> Result<TokenStream> {
        let prepared = self.prepare(request).await?;

        let has_audio = prepared.media.has_audio();
        let idle_timeout = self.config.timeouts.per_token_for(has_audio);
        let total_timeout = self.config.timeouts.total_for(has_audio);

        let (tx, mut rx) = mpsc::unbounded_channel::<ProducerEvent>();
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let cancel = Arc::clone(&cancel);
            let model = Arc::clone(&prepared.model);
            let prompt = prepared.prompt.clone();
            let media = prepared.media.clone();
            let params = prepared.params.clone();
            tokio::task::spawn_blocking(move || {
                let mut on_token = |token: &str| {
                    if cancel.load(Ordering::Acquire) {
                        return false;
                    }
                    tx.send(ProducerEvent::Token(token.to_string())).is_ok()
                };
                let event = match model.stream_generate(&prompt, &media, &params, &mut on_token) {
                    Ok(()) => ProducerEvent::Finished,
                    Err(e) => ProducerEvent::Failed(e),
                };
                let _ = tx.send(event);
            });
        }

        let mut prepared = prepared;
        let stream = async_stream::stream! {
            let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
            let started = Instant::now();
            let total_deadline = started + total_timeout;
            let mut last_token = started;
            let mut response = String::new();
            let mut fragments = 0usize;
            let mut completed = false;
            let mut timed_out = false;

            loop {
                let idle_deadline = last_token + idle_timeout;
                let deadline = idle_deadline.min(total_deadline);
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(ProducerEvent::Token(token))) => {
                        last_token = Instant::now();
                        fragments += 1;
                        response.push_str(&token);
                        yield token;
                    }
                    Ok(Some(ProducerEvent::Finished)) => {
                        completed = true;
                        break;
                    }
                    Ok(Some(ProducerEvent::Failed(e))) => {
                        error!("Streaming generation failed: {e}");
                        let reason = match e {
                            Error::GenerationFailed(msg) => msg,
                            other => other.to_string(),
                        };
                        yield format!("{ERROR_MARKER}Generation failed: {reason}");
                        break;
                    }
                    Ok(None) => {
                        error!("Streaming producer exited without finishing");
                        yield format!("{ERROR_MARKER}Generation failed: producer stopped unexpectedly");
                        break;
                    }
                    Err(_) => {
                        cancel.store(true, Ordering::Release);
                        timed_out = true;
                        let reason = if idle_deadline < total_deadline {
                            "Generation timeout"
                        } else {
                            "Total generation timeout"
                        };
                        warn!(
                            "{reason} after {fragments} fragment(s), {:.1}s elapsed",
                            started.elapsed().as_secs_f32()
                        );
                        yield format!("{ERROR_MARKER}{reason}");
                        break;
                    }
                }
            }

            // A timed-out reply keeps what was streamed before the deadline.
            if completed || timed_out {
                let text = response.trim();
                if text.is_empty() {
                    warn!("Model streamed an empty response");
                } else {
                    prepared.store.append_text(ChatRole::Assistant, text, false);
                }
                let metadata = prepared.metadata(
                    started.elapsed().as_secs_f64() * 1000.0,
                    text.len(),
                );
                info!(
                    "Streamed {} fragment(s), {} chars in {:.0}ms (conversation length {})",
                    fragments,
                    metadata.response_length,
                    metadata.generation_time_ms,
                    metadata.conversation_length
                );
            } else {
                debug!("Discarding partial response of {} chars", response.len());
            }

            // Release the session before signalling completion.
            drop(prepared);
            yield DONE_SENTINEL.to_string();
        };

        Ok(Box::pin(stream))
    }
}
