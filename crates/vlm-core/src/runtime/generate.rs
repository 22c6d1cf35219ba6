//! Request preparation and batch generation.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::conversation::{ActiveMedia, ChatRole, ContentItem, ConversationStore};
use crate::error::{Error, Result};
use crate::model::{LoadedModel, SamplingParams};
use crate::prompt;
use crate::runtime::service::VlmService;
use crate::runtime::types::{GenerationMetadata, GenerationOutput, GenerationRequest, MAX_TOKENS_LIMIT};

/// Everything needed to invoke the model, with the session held for the
/// duration of the request.
pub(crate) struct PreparedGeneration {
    pub store: OwnedMutexGuard<ConversationStore>,
    pub model: Arc<dyn LoadedModel>,
    pub model_id: String,
    pub prompt: String,
    pub media: ActiveMedia,
    pub params: SamplingParams,
}

impl PreparedGeneration {
    pub fn metadata(&self, generation_time_ms: f64, response_length: usize) -> GenerationMetadata {
        GenerationMetadata {
            model: self.model_id.clone(),
            num_images: self.media.num_images(),
            num_audios: self.media.num_audios(),
            conversation_length: self.store.len(),
            generation_time_ms,
            response_length,
        }
    }
}

impl VlmService {
    /// Validate prompt and sampling fields, filling unset ones from config.
    pub(crate) fn resolve_params(&self, request: &GenerationRequest) -> Result<SamplingParams> {
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("Empty prompt provided".to_string()));
        }
        let max_chars = self.config.max_prompt_length;
        if request.prompt.chars().count() > max_chars {
            return Err(Error::InvalidRequest(format!(
                "Prompt too long (max {max_chars} characters)"
            )));
        }

        let defaults = &self.config.sampling;
        let params = SamplingParams {
            max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: request.temperature.unwrap_or(defaults.temperature),
            top_k: request.top_k.unwrap_or(defaults.top_k),
            top_p: request.top_p.unwrap_or(defaults.top_p),
        };

        if !(1..=MAX_TOKENS_LIMIT).contains(&params.max_tokens) {
            return Err(Error::InvalidRequest(format!(
                "max_tokens must be between 1 and {MAX_TOKENS_LIMIT}, got {}",
                params.max_tokens
            )));
        }
        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be non-negative, got {}",
                params.temperature
            )));
        }
        if !(params.top_p > 0.0 && params.top_p <= 1.0) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                params.top_p
            )));
        }
        Ok(params)
    }

    /// Steps shared by batch and streaming generation: validate, make sure the
    /// model is ready, record the user turn and build the final prompt.
    pub(crate) async fn prepare(&self, request: GenerationRequest) -> Result<PreparedGeneration> {
        let mut params = self.resolve_params(&request)?;

        if !self.lifecycle.ensure_ready().await {
            return Err(self.lifecycle.unavailable_error().await);
        }
        let handle = match self.lifecycle.handle().await {
            Some(handle) => handle,
            None => return Err(self.lifecycle.unavailable_error().await),
        };

        let template_name = request
            .prompt_template
            .as_deref()
            .unwrap_or(prompt::DEFAULT_TEMPLATE);
        let system_template = {
            let prompts = self.prompts.read().await;
            if prompts.get_info(template_name).is_none() {
                debug!("Unknown prompt template {template_name}, using default");
            }
            let template = prompts.get_prompt(template_name);
            template.sampling_policy.apply(&mut params);
            template.template.clone()
        };

        let session = self.session(request.session()).await;
        let mut store = session.lock_owned().await;

        if request.has_media() {
            store.evict_media_turns();
            let GenerationRequest {
                prompt, image, audio, ..
            } = request;
            let content = self
                .normalize_media(prompt, image, audio)
                .await
                .map_err(|e| Error::MediaProcessingFailed(format!("Media processing failed: {e}")))?;
            store.append_media(ChatRole::User, content, false);
        } else {
            store.append_text(ChatRole::User, request.prompt, true);
        }

        let media = store.most_recent_active_media();
        let conversation = prompt::render(&store, Some(&system_template));
        let prompt = handle
            .model
            .apply_chat_template(&conversation, media.num_images(), media.num_audios())
            .map_err(|e| match e {
                Error::PromptFormattingFailed(_) => e,
                other => Error::PromptFormattingFailed(other.to_string()),
            })?;

        debug!(
            "Prepared prompt of {} chars ({} image(s), {} audio)",
            prompt.len(),
            media.num_images(),
            media.num_audios()
        );

        Ok(PreparedGeneration {
            store,
            model: handle.model,
            model_id: handle.model_id,
            prompt,
            media,
            params,
        })
    }

    /// Image first, then audio. Assets from a failed call are dropped, which
    /// frees the raster and deletes any transcoded file.
    async fn normalize_media(
        &self,
        prompt: String,
        image: Option<Vec<u8>>,
        audio: Option<Vec<u8>>,
    ) -> Result<Vec<ContentItem>> {
        let mut content = vec![ContentItem::Text(prompt)];
        if let Some(bytes) = image {
            let image = self.normalizer.normalize_image(bytes).await?;
            content.push(ContentItem::Image(image));
        }
        if let Some(bytes) = audio {
            let audio = self.normalizer.normalize_audio(&bytes).await?;
            content.push(ContentItem::Audio(audio));
        }
        Ok(content)
    }

    /// Generate a complete response under a single deadline.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        let user_prompt = request.prompt.clone();
        let mut prepared = self.prepare(request).await?;

        let deadline = self.config.timeouts.total_for(prepared.media.has_audio());
        let model = Arc::clone(&prepared.model);
        let prompt = prepared.prompt.clone();
        let media = prepared.media.clone();
        let params = prepared.params.clone();

        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || model.generate(&prompt, &media, &params));
        let text = match tokio::time::timeout(deadline, task).await {
            Err(_) => {
                warn!("Generation timed out after {:.0}s", deadline.as_secs_f32());
                return Err(Error::GenerationTimeout(format!(
                    "Generation timed out after {:.0} seconds",
                    deadline.as_secs_f32()
                )));
            }
            Ok(Err(e)) => {
                return Err(Error::GenerationFailed(format!("Generation task failed: {e}")))
            }
            Ok(Ok(Err(e))) => {
                return Err(match e {
                    Error::GenerationFailed(_) => e,
                    other => Error::GenerationFailed(other.to_string()),
                })
            }
            Ok(Ok(Ok(text))) => text,
        };
        let generation_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let text = text.trim().to_string();
        if text.is_empty() {
            warn!("Model returned an empty response");
        } else {
            prepared
                .store
                .append_text(ChatRole::Assistant, text.clone(), false);
        }

        let metadata = prepared.metadata(generation_time_ms, text.len());
        info!(
            "Generated {} chars in {:.0}ms (conversation length {})",
            metadata.response_length, metadata.generation_time_ms, metadata.conversation_length
        );

        Ok(GenerationOutput {
            text,
            prompt: user_prompt,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ContentDescriptor;
    use crate::runtime::testing::{
        failing_service, png_bytes, service, service_with_config, test_config, ScriptedModel,
    };
    use crate::runtime::DEFAULT_SESSION;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn text_generation_appends_both_turns() {
        let model = ScriptedModel::replying(&["Hello", " there"]);
        let service = service(model.clone());

        let output = service.generate(GenerationRequest::new("hi")).await.unwrap();
        assert_eq!(output.text, "Hello there");
        assert_eq!(output.prompt, "hi");
        assert_eq!(output.metadata.model, "test-model");
        assert_eq!(output.metadata.conversation_length, 2);
        assert_eq!(output.metadata.response_length, 11);
        assert_eq!(
            model.last().prompt,
            "<start_of_turn>user\nhi<end_of_turn>\n<start_of_turn>model\n"
        );

        let history = service.conversation_history(DEFAULT_SESSION).await;
        assert_eq!(history.length, 2);
    }

    #[tokio::test]
    async fn invalid_max_tokens_never_reaches_the_model() {
        let model = ScriptedModel::replying(&["x"]);
        let service = service(model.clone());

        for max_tokens in [0, 5000] {
            let err = service
                .generate(GenerationRequest::new("hi").with_max_tokens(max_tokens))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "{err}");
        }
        let err = service
            .generate(GenerationRequest::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "{err}");

        assert_eq!(model.calls(), 0);
        assert_eq!(model.template_calls.load(Ordering::SeqCst), 0);
        assert!(!service.lifecycle().is_loaded());
        assert_eq!(service.conversation_history(DEFAULT_SESSION).await.length, 0);
    }

    #[tokio::test]
    async fn overlong_prompt_is_rejected() {
        let mut config = test_config();
        config.max_prompt_length = 8;
        let service = service_with_config(ScriptedModel::replying(&["x"]), config);

        let err = service
            .generate(GenerationRequest::new("123456789"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Prompt too long"), "{err}");
    }

    #[tokio::test]
    async fn unavailable_model_is_reported() {
        let service = failing_service();
        let err = service
            .generate(GenerationRequest::new("hi"))
            .await
            .unwrap_err();
        match err {
            Error::ServiceUnavailable(reason) => assert!(reason.contains("weights missing")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn image_request_passes_active_media() {
        let model = ScriptedModel::replying(&["A black square."]);
        let service = service(model.clone());

        let output = service
            .generate(GenerationRequest::new("What is this?").with_image(png_bytes(1024, 512)))
            .await
            .unwrap();
        assert_eq!(output.metadata.num_images, 1);
        assert_eq!(output.metadata.num_audios, 0);
        assert!(model.last().prompt.starts_with("<image><start_of_turn>user\n"));

        let history = service.conversation_history(DEFAULT_SESSION).await;
        assert_eq!(
            history.conversation_history[0].content[1],
            ContentDescriptor::Image {
                width: 512,
                height: 256
            }
        );

        // A follow-up text turn drops the image.
        let output = service
            .generate(GenerationRequest::new("Thanks"))
            .await
            .unwrap();
        assert_eq!(output.metadata.num_images, 0);
        assert_eq!(output.metadata.conversation_length, 3);
    }

    #[tokio::test]
    async fn oversized_image_fails_after_evicting_old_media() {
        let model = ScriptedModel::replying(&["ok"]);
        let service = service(model.clone());

        service
            .generate(GenerationRequest::new("first").with_image(png_bytes(16, 16)))
            .await
            .unwrap();
        assert_eq!(service.conversation_history(DEFAULT_SESSION).await.length, 2);

        let oversized = vec![0u8; service.config().media.max_image_bytes + 1];
        let err = service
            .generate(GenerationRequest::new("second").with_image(oversized))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaProcessingFailed(_)), "{err}");

        // Only the assistant reply survives; the earlier image turn was evicted.
        let history = service.conversation_history(DEFAULT_SESSION).await;
        assert_eq!(history.length, 1);
        assert_eq!(
            history.conversation_history[0].content,
            vec![ContentDescriptor::Text {
                text: "ok".to_string()
            }]
        );
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn audio_request_uses_transcoded_file() {
        let model = ScriptedModel::replying(&["You said hello."]);
        let service = service(model.clone());

        let output = service
            .generate(GenerationRequest::new("Transcribe").with_audio(b"fake audio".to_vec()))
            .await
            .unwrap();
        assert_eq!(output.metadata.num_audios, 1);
        assert!(model.last().prompt.starts_with("<audio>"));

        let history = service.conversation_history(DEFAULT_SESSION).await;
        assert_eq!(
            history.conversation_history[0].content[1],
            ContentDescriptor::Audio { size_bytes: 10 }
        );
    }

    #[tokio::test]
    async fn template_policy_clamps_sampling() {
        let model = ScriptedModel::replying(&["{}"]);
        let service = service(model.clone());

        service
            .generate(GenerationRequest::new("extract").with_template("structured_data_extraction"))
            .await
            .unwrap();
        let invocation = model.last();
        let params = invocation.params.unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_p, 0.8);
        assert_eq!(params.top_k, 40);
        assert!(invocation.prompt.starts_with("# GenomeStruct AI"));

        service
            .generate(GenerationRequest::new("chat").with_template("does_not_exist"))
            .await
            .unwrap();
        assert!(model.last().prompt.starts_with("<start_of_turn>user\n"));
    }

    #[tokio::test]
    async fn model_errors_leave_only_the_user_turn() {
        let service = service(ScriptedModel::failing());
        let err = service
            .generate(GenerationRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationFailed(_)), "{err}");
        assert_eq!(service.conversation_history(DEFAULT_SESSION).await.length, 1);
    }

    #[tokio::test]
    async fn slow_batch_generation_times_out() {
        let mut config = test_config();
        config.timeouts.total = Duration::from_millis(50);
        let service = service_with_config(
            ScriptedModel::stalling(&["late"], Duration::from_millis(300)),
            config,
        );

        let err = service
            .generate(GenerationRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationTimeout(_)), "{err}");
    }

    #[tokio::test]
    async fn history_stays_bounded() {
        let mut config = test_config();
        config.max_conversation_length = 4;
        let service = service_with_config(ScriptedModel::replying(&["ok"]), config);

        for i in 0..5 {
            let output = service
                .generate(GenerationRequest::new(format!("turn {i}")))
                .await
                .unwrap();
            assert!(output.metadata.conversation_length <= 4);
        }
        assert_eq!(service.conversation_history(DEFAULT_SESSION).await.length, 4);
    }
}
