//! Scripted model and service builders shared by runtime tests.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::config::{EngineConfig, LoadConfig, TimeoutConfig};
use crate::conversation::ActiveMedia;
use crate::error::{Error, Result};
use crate::media::{AudioTranscoder, MediaNormalizer};
use crate::model::{LoadedModel, ModelLoader, SamplingParams};
use crate::runtime::VlmService;

#[derive(Debug, Clone, Default)]
pub(crate) struct Invocation {
    pub prompt: String,
    pub num_images: usize,
    pub num_audios: usize,
    pub params: Option<SamplingParams>,
}

pub(crate) struct ScriptedModel {
    tokens: Vec<String>,
    /// Pause after the first emitted token
    stall: Duration,
    fail: bool,
    pub generate_calls: AtomicUsize,
    pub template_calls: AtomicUsize,
    pub stopped_early: AtomicBool,
    pub last: Mutex<Invocation>,
}

impl ScriptedModel {
    pub fn replying(tokens: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(tokens, Duration::ZERO, false))
    }

    pub fn stalling(tokens: &[&str], stall: Duration) -> Arc<Self> {
        Arc::new(Self::build(tokens, stall, false))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(&["partial"], Duration::ZERO, true))
    }

    fn build(tokens: &[&str], stall: Duration, fail: bool) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            stall,
            fail,
            generate_calls: AtomicUsize::new(0),
            template_calls: AtomicUsize::new(0),
            stopped_early: AtomicBool::new(false),
            last: Mutex::new(Invocation::default()),
        }
    }

    pub fn calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Invocation {
        self.last.lock().unwrap().clone()
    }

    fn record(&self, prompt: &str, media: &ActiveMedia, params: &SamplingParams) {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        last.prompt = prompt.to_string();
        last.num_images = media.num_images();
        last.num_audios = media.num_audios();
        last.params = Some(params.clone());
    }
}

impl LoadedModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "test-model"
    }

    fn apply_chat_template(
        &self,
        conversation: &str,
        num_images: usize,
        num_audios: usize,
    ) -> Result<String> {
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        let mut prompt = String::new();
        for _ in 0..num_images {
            prompt.push_str("<image>");
        }
        for _ in 0..num_audios {
            prompt.push_str("<audio>");
        }
        prompt.push_str(conversation);
        Ok(prompt)
    }

    fn generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
    ) -> Result<String> {
        self.record(prompt, media, params);
        std::thread::sleep(self.stall);
        if self.fail {
            return Err(Error::GenerationFailed("scripted failure".to_string()));
        }
        Ok(self.tokens.concat())
    }

    fn stream_generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        self.record(prompt, media, params);
        for (i, token) in self.tokens.iter().enumerate() {
            if i == 1 {
                std::thread::sleep(self.stall);
            }
            if !on_token(token) {
                self.stopped_early.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
        if self.fail {
            return Err(Error::GenerationFailed("scripted failure".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct StaticLoader(pub Arc<ScriptedModel>);

impl ModelLoader for StaticLoader {
    fn load(&self, _model_id: &str) -> Result<Arc<dyn LoadedModel>> {
        Ok(self.0.clone())
    }
}

pub(crate) struct BrokenLoader;

impl ModelLoader for BrokenLoader {
    fn load(&self, _model_id: &str) -> Result<Arc<dyn LoadedModel>> {
        Err(Error::ModelLoadError("weights missing".to_string()))
    }
}

/// Copies uploaded audio to the output path.
pub(crate) struct CopyTranscoder;

#[async_trait]
impl AudioTranscoder for CopyTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<()> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig {
        model_id: "test-model".to_string(),
        max_conversation_length: 10,
        load: LoadConfig {
            max_retries: 1,
            retry_delay: Duration::ZERO,
            load_timeout: Duration::from_secs(5),
        },
        timeouts: TimeoutConfig {
            total: Duration::from_secs(5),
            total_with_audio: Duration::from_secs(10),
            per_token: Duration::from_millis(100),
            per_token_with_audio: Duration::from_millis(200),
        },
        ..EngineConfig::default()
    };
    config.media.max_image_bytes = 1024 * 1024;
    config.media.max_audio_bytes = 64 * 1024;
    config
}

pub(crate) fn service_with_config(model: Arc<ScriptedModel>, config: EngineConfig) -> VlmService {
    let normalizer = MediaNormalizer::with_transcoder(config.media.clone(), Arc::new(CopyTranscoder));
    VlmService::with_normalizer(config, Arc::new(StaticLoader(model)), normalizer)
}

pub(crate) fn service(model: Arc<ScriptedModel>) -> VlmService {
    service_with_config(model, test_config())
}

pub(crate) fn failing_service() -> VlmService {
    let config = test_config();
    let normalizer = MediaNormalizer::with_transcoder(config.media.clone(), Arc::new(CopyTranscoder));
    VlmService::with_normalizer(config, Arc::new(BrokenLoader), normalizer)
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
