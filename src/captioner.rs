use crate::config::{Config, Which};
use crate::device::{describe, select_device};
use crate::load_image::preprocess;
use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{blip, blip_text, quantized_blip};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// `[DEC]`, the token BLIP's text decoder starts every caption from.
pub const DEC_TOKEN_ID: u32 = 30522;
pub const SEP_TOKEN_ID: u32 = 102;

const SEED: u64 = 1337;
const QUANTIZED_REPO: &str = "lmz/candle-blip";

/// Turns a decoded image into a caption. Implementations are shared by every request and must
/// not change observable state between calls.
pub trait Captioner: Send + Sync {
    fn caption(&self, image: &RgbImage) -> Result<String>;
}

enum Model {
    M(blip::BlipForConditionalGeneration),
    Q(quantized_blip::BlipForConditionalGeneration),
}

impl Model {
    fn load(path: &Path, config: &blip::Config, quantized: bool, device: &Device) -> Result<Self> {
        if quantized {
            let vb = quantized_blip::VarBuilder::from_gguf(path, device)?;
            let model = quantized_blip::BlipForConditionalGeneration::new(config, vb)?;
            Ok(Self::Q(model))
        } else {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
            let model = blip::BlipForConditionalGeneration::new(config, vb)?;
            Ok(Self::M(model))
        }
    }

    fn vision_forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::M(m) => m.vision_model().forward(xs),
            Self::Q(m) => m.vision_model().forward(xs),
        }
    }

    fn text_decoder_forward(&mut self, xs: &Tensor, img_xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::M(m) => m.text_decoder().forward(xs, img_xs),
            Self::Q(m) => m.text_decoder().forward(xs, img_xs),
        }
    }

    fn reset_kv_cache(&mut self) {
        match self {
            Self::M(m) => m.text_decoder().reset_kv_cache(),
            Self::Q(m) => m.text_decoder().reset_kv_cache(),
        }
    }
}

/// Model instances handed out round-robin. The text decoder keeps a KV cache so an instance
/// serves one caption at a time; the pool size caps concurrent inference.
struct ModelPool {
    models: Vec<Mutex<Model>>,
    next_idx: AtomicUsize,
}

impl ModelPool {
    fn new(models: Vec<Model>) -> Self {
        Self {
            models: models.into_iter().map(Mutex::new).collect(),
            next_idx: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, Model> {
        let len = self.models.len();
        let start = self.next_idx.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            match self.models[(start + offset) % len].try_lock() {
                Ok(guard) => return guard,
                // the cache is reset before every caption, a panic mid-generation leaves nothing behind
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            }
        }
        self.models[start]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: 384,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };
    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

/// Runs the decoder loop from `[DEC]` until `[SEP]` or until the sequence holds `max_length`
/// tokens. The first step sees the whole prompt, later steps only the newest token since the
/// decoder caches the rest. Returns the generated ids without the prompt.
pub fn greedy_decode<F>(max_length: usize, mut next_token: F) -> candle_core::Result<Vec<u32>>
where
    F: FnMut(&[u32]) -> candle_core::Result<u32>,
{
    let mut token_ids = vec![DEC_TOKEN_ID];
    let mut index = 0;
    while token_ids.len() < max_length {
        let context_size = if index > 0 { 1 } else { token_ids.len() };
        let start_pos = token_ids.len().saturating_sub(context_size);
        let token = next_token(&token_ids[start_pos..])?;
        if token == SEP_TOKEN_ID {
            break;
        }
        token_ids.push(token);
        index += 1;
    }
    Ok(token_ids.split_off(1))
}

pub struct BlipCaptioner {
    pool: ModelPool,
    tokenizer: Tokenizer,
    device: Device,
    max_length: usize,
}

impl BlipCaptioner {
    /// Fetches (or reuses from the hub cache) the weights and tokenizer, picks the device and
    /// builds `config.workers` model instances on it.
    pub fn load(config: &Config) -> Result<Self> {
        config.validate()?;
        let start_time = Instant::now();

        let device = select_device(config.cpu)?;
        info!("Using device: {}", describe(&device));

        let model_id = config.model_id();
        let api = hf_hub::api::sync::Api::new()?;
        let model_file: PathBuf = match &config.weights {
            Some(path) => path.clone(),
            None if config.quantized => api
                .model(QUANTIZED_REPO.to_string())
                .get(config.which.quantized_file())?,
            None => api
                .repo(hf_hub::Repo::with_revision(
                    model_id.clone(),
                    hf_hub::RepoType::Model,
                    config.revision(),
                ))
                .get("model.safetensors")?,
        };
        let tokenizer_file: PathBuf = match &config.tokenizer {
            Some(path) => path.clone(),
            None => api.model(model_id.clone()).get("tokenizer.json")?,
        };
        info!("Loading {} from {}", model_id, model_file.display());

        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(E::msg)?;
        let blip_config = match config.which {
            Which::Base => blip_base_config(),
            Which::Large => blip::Config::image_captioning_large(),
        };

        let mut models = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            debug!("Loading model instance {}/{}", i + 1, config.workers);
            models.push(Model::load(&model_file, &blip_config, config.quantized, &device)?);
        }

        info!(
            "Model and tokenizer loaded successfully: {} instance(s) in {:.2}s",
            config.workers,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            pool: ModelPool::new(models),
            tokenizer,
            device,
            max_length: config.max_length,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Captioner for BlipCaptioner {
    fn caption(&self, image: &RgbImage) -> Result<String> {
        let image = preprocess(image, &self.device)?.unsqueeze(0)?;
        let mut model = self.pool.acquire();
        let image_embeds = model.vision_forward(&image)?;
        model.reset_kv_cache();

        let mut logits_processor = LogitsProcessor::new(SEED, None, None);
        let token_ids = greedy_decode(self.max_length, |context| {
            let input_ids = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder_forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            logits_processor.sample(&logits)
        })?;
        drop(model);

        let caption = self.tokenizer.decode(&token_ids, true).map_err(E::msg)?;
        Ok(caption.trim().to_string())
    }
}
