//! Native Gemma 3 text backend on candle.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::gemma3::{Config as Gemma3Config, Model as Gemma3Model};
use hf_hub::api::sync::ApiBuilder;
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::device::DeviceProfile;
use crate::conversation::ActiveMedia;
use crate::error::{Error, Result};
use crate::model::{LoadedModel, ModelLoader, SamplingParams};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Loads Gemma 3 checkpoints from a local directory or the Hugging Face hub.
#[derive(Debug, Clone)]
pub struct Gemma3Loader {
    cache_dir: PathBuf,
    use_metal: bool,
}

impl Gemma3Loader {
    pub fn new(cache_dir: PathBuf, use_metal: bool) -> Self {
        Self {
            cache_dir,
            use_metal,
        }
    }

    fn resolve_model_dir(&self, model_id: &str) -> Result<PathBuf> {
        let local = Path::new(model_id);
        if local.is_dir() {
            return Ok(local.to_path_buf());
        }

        fs::create_dir_all(&self.cache_dir)?;
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .build()
            .map_err(|e| Error::ModelLoadError(format!("Hugging Face hub unavailable: {e}")))?;
        let repo = api.model(model_id.to_string());
        let fetch = |file: &str| {
            repo.get(file)
                .map_err(|e| Error::ModelLoadError(format!("Failed to fetch {model_id}/{file}: {e}")))
        };

        let config_path = fetch(CONFIG_FILE)?;
        fetch(TOKENIZER_FILE)?;
        match fetch(WEIGHTS_INDEX_FILE) {
            Ok(index_path) => {
                for shard in shard_files(&fs::read_to_string(index_path)?)? {
                    fetch(&shard)?;
                }
            }
            Err(_) => {
                fetch(WEIGHTS_FILE)?;
            }
        }

        config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::ModelLoadError(format!("Invalid cache path for {model_id}")))
    }
}

impl ModelLoader for Gemma3Loader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn LoadedModel>> {
        let model_dir = self.resolve_model_dir(model_id)?;
        let device = DeviceProfile::detect(self.use_metal);
        let model = Gemma3TextModel::load(model_id, &model_dir, device)?;
        Ok(Arc::new(model))
    }
}

struct GemmaTokenizer {
    inner: Tokenizer,
    bos: Option<u32>,
    eos: u32,
    end_of_turn: u32,
}

impl GemmaTokenizer {
    fn load(model_dir: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(model_dir.join(TOKENIZER_FILE))
            .map_err(|e| Error::TokenizationError(e.to_string()))?;

        let end_of_turn = inner.token_to_id("<end_of_turn>").ok_or_else(|| {
            Error::TokenizationError("Missing Gemma special token: <end_of_turn>".to_string())
        })?;
        let eos = inner.token_to_id("<eos>").unwrap_or(end_of_turn);
        let bos = inner.token_to_id("<bos>");

        Ok(Self {
            inner,
            bos,
            eos,
            end_of_turn,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        ids.extend(self.bos);
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::TokenizationError(e.to_string()))
    }

    fn is_stop(&self, id: u32) -> bool {
        id == self.eos || id == self.end_of_turn
    }
}

pub struct Gemma3TextModel {
    model_id: String,
    device: DeviceProfile,
    tokenizer: GemmaTokenizer,
    model: Mutex<Gemma3Model>,
}

impl Gemma3TextModel {
    pub fn load(model_id: &str, model_dir: &Path, device: DeviceProfile) -> Result<Self> {
        let tokenizer = GemmaTokenizer::load(model_dir)?;
        let config_str = fs::read_to_string(model_dir.join(CONFIG_FILE))?;
        let vocab_size = tokenizer.inner.get_vocab_size(true);
        let config = parse_config(&config_str, vocab_size)?;

        let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
        let (weight_paths, names) = if index_path.exists() {
            let index = fs::read_to_string(&index_path)?;
            let paths = shard_files(&index)?
                .into_iter()
                .map(|shard| model_dir.join(shard))
                .collect::<Vec<_>>();
            (paths, tensor_names(&index)?)
        } else {
            (vec![model_dir.join(WEIGHTS_FILE)], Vec::new())
        };

        let wrapped = is_multimodal_checkpoint(&config_str)
            || names.iter().any(|name| name.starts_with("language_model."));

        let dtype = device.dtype();
        // SAFETY: the checkpoint files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_paths, dtype, &device.device)? };
        let vb = if wrapped { vb.pp("language_model") } else { vb };

        let model = Gemma3Model::new(false, &config, vb)?;
        info!("Loaded Gemma 3 model {model_id} on {:?} ({dtype:?})", device.kind);

        Ok(Self {
            model_id: model_id.to_string(),
            device,
            tokenizer,
            model: Mutex::new(model),
        })
    }

    fn sampler(params: &SamplingParams) -> LogitsProcessor {
        let temperature = f64::from(params.temperature);
        let top_p = f64::from(params.top_p);
        let sampling = if temperature <= 0.0 {
            Sampling::ArgMax
        } else if params.top_k == 0 {
            Sampling::TopP {
                p: top_p,
                temperature,
            }
        } else {
            Sampling::TopKThenTopP {
                k: params.top_k,
                p: top_p,
                temperature,
            }
        };
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(299_792_458);
        LogitsProcessor::from_sampling(seed, sampling)
    }
}

impl LoadedModel for Gemma3TextModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn apply_chat_template(
        &self,
        conversation: &str,
        num_images: usize,
        num_audios: usize,
    ) -> Result<String> {
        if num_images > 0 || num_audios > 0 {
            return Err(Error::PromptFormattingFailed(format!(
                "{} is a text-only model and cannot take image or audio input",
                self.model_id
            )));
        }
        Ok(conversation.to_string())
    }

    fn generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
    ) -> Result<String> {
        let mut text = String::new();
        self.stream_generate(prompt, media, params, &mut |delta: &str| {
            text.push_str(delta);
            true
        })?;
        Ok(text)
    }

    fn stream_generate(
        &self,
        prompt: &str,
        media: &ActiveMedia,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        if media.num_images() > 0 || media.num_audios() > 0 {
            return Err(Error::GenerationFailed(
                "Media input is not supported by the Gemma 3 text backend".to_string(),
            ));
        }

        let prompt_ids = self.tokenizer.encode(prompt)?;
        let Some((&first, rest)) = prompt_ids.split_first() else {
            return Err(Error::GenerationFailed("Prompt produced no tokens".to_string()));
        };

        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::GenerationFailed("Gemma model mutex poisoned".to_string()))?;
        model.clear_kv_cache();

        // Prefill one token at a time; long single-pass prefills trip candle's
        // KV-cache `slice_set` on some Gemma 3 checkpoints.
        let mut input = Tensor::from_vec(vec![first], (1, 1), &self.device.device)?;
        let mut offset = 0usize;
        for &token in rest {
            model.forward(&input, offset)?;
            offset += 1;
            input = Tensor::from_vec(vec![token], (1, 1), &self.device.device)?;
        }

        let mut sampler = Self::sampler(params);
        let mut generated = Vec::new();
        let mut emitted = String::new();

        for _ in 0..params.max_tokens {
            let logits = model.forward(&input, offset)?;
            let logits = last_position(&logits)?;
            let next = sampler.sample(&logits)?;
            if self.tokenizer.is_stop(next) {
                break;
            }

            generated.push(next);
            let decoded = self.tokenizer.decode(&generated)?;
            let delta = text_delta(&emitted, &decoded);
            emitted = decoded;
            if !delta.is_empty() && !on_token(&delta) {
                debug!("Generation stopped by consumer after {} tokens", generated.len());
                break;
            }

            offset += 1;
            input = Tensor::from_vec(vec![next], (1, 1), &self.device.device)?;
        }

        Ok(())
    }
}

/// Logits for the final position as an F32 vector tensor.
fn last_position(logits: &Tensor) -> Result<Tensor> {
    let logits = match logits.rank() {
        1 => logits.clone(),
        2 => logits.get(logits.dim(0)?.saturating_sub(1))?,
        3 => logits.get(0)?.get(logits.dim(1)?.saturating_sub(1))?,
        rank => {
            return Err(Error::GenerationFailed(format!(
                "Unexpected Gemma logits rank {rank} with dims {:?}",
                logits.dims()
            )))
        }
    };
    Ok(logits.to_dtype(DType::F32)?)
}

fn text_delta(previous: &str, current: &str) -> String {
    if let Some(delta) = current.strip_prefix(previous) {
        return delta.to_string();
    }
    let common = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();
    current.chars().skip(common).collect()
}

fn weight_map(index: &str) -> Result<serde_json::Map<String, Value>> {
    let index: Value = serde_json::from_str(index)?;
    index
        .get("weight_map")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Error::ModelLoadError(format!("Invalid {WEIGHTS_INDEX_FILE} format")))
}

fn shard_files(index: &str) -> Result<Vec<String>> {
    let mut shards: Vec<String> = weight_map(index)?
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

fn tensor_names(index: &str) -> Result<Vec<String>> {
    Ok(weight_map(index)?.keys().cloned().collect())
}

fn is_multimodal_checkpoint(config_str: &str) -> bool {
    let Ok(root) = serde_json::from_str::<Value>(config_str) else {
        return false;
    };
    root.get("architectures")
        .and_then(Value::as_array)
        .is_some_and(|archs| {
            archs
                .iter()
                .any(|a| a.as_str() == Some("Gemma3ForConditionalGeneration"))
        })
}

/// Parse `config.json`, reading `text_config` for multimodal checkpoints and
/// filling keys older exports omit with Gemma 3 1B values.
fn parse_config(config_str: &str, tokenizer_vocab_size: usize) -> Result<Gemma3Config> {
    let root: Value = serde_json::from_str(config_str)?;
    let source = root.get("text_config").cloned().unwrap_or(root);
    let mut object: BTreeMap<String, Value> = source
        .as_object()
        .ok_or_else(|| Error::ModelLoadError("Invalid Gemma config.json format".to_string()))?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let defaults: [(&str, Value); 17] = [
        ("attention_bias", Value::Bool(false)),
        ("hidden_activation", Value::from("gelu_pytorch_tanh")),
        ("hidden_size", Value::from(1152u64)),
        ("intermediate_size", Value::from(6912u64)),
        ("num_attention_heads", Value::from(4u64)),
        ("num_hidden_layers", Value::from(26u64)),
        ("num_key_value_heads", Value::from(1u64)),
        ("head_dim", Value::from(256u64)),
        ("rms_norm_eps", Value::from(1e-6f64)),
        ("rope_theta", Value::from(1_000_000f64)),
        ("rope_local_base_freq", Value::from(10_000f64)),
        ("query_pre_attn_scalar", Value::from(256u64)),
        ("sliding_window", Value::from(512u64)),
        ("sliding_window_pattern", Value::from(6u64)),
        ("max_position_embeddings", Value::from(32_768u64)),
        ("final_logit_softcapping", Value::Null),
        ("attn_logit_softcapping", Value::Null),
    ];
    for (key, value) in defaults {
        object.entry(key.to_string()).or_insert(value);
    }
    object
        .entry("vocab_size".to_string())
        .or_insert_with(|| Value::from(tokenizer_vocab_size as u64));

    Ok(serde_json::from_value(Value::Object(object.into_iter().collect()))?)
}
