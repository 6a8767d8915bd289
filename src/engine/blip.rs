//! Local BLIP captioning on candle.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use image::imageops::FilterType;
use image::RgbImage;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use super::CaptioningEngine;
use crate::config::{BlipConfig, DevicePreference};
use crate::error::CaptionError;
use crate::upload::DecodedImage;

/// Encoder resolution of the published captioning checkpoints.
pub const DEFAULT_IMAGE_SIZE: usize = 384;

const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// `[DEC]`, the decoder start token.
const BOS_TOKEN_ID: u32 = 30522;
/// `[SEP]`, ends a caption.
const SEP_TOKEN_ID: u32 = 102;

/// Unused with greedy decoding, but `LogitsProcessor` wants one.
const SAMPLING_SEED: u64 = 299_792_458;

/// Picks the compute device for the model.
pub fn select_device(preference: DevicePreference) -> anyhow::Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => {
            Device::new_cuda(0).context("CUDA device requested but not available")
        }
        DevicePreference::Metal => {
            Device::new_metal(0).context("Metal device requested but not available")
        }
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(e) => warn!("CUDA support compiled in but unusable, falling back: {e}"),
                }
            }
            if candle_core::utils::metal_is_available() {
                match Device::new_metal(0) {
                    Ok(device) => return Ok(device),
                    Err(e) => warn!("Metal support compiled in but unusable, falling back: {e}"),
                }
            }
            Ok(Device::Cpu)
        }
    }
}

/// Resizes to `size`x`size` and normalizes with the CLIP statistics.
///
/// Returns a `(3, size, size)` f32 tensor on the CPU.
pub fn preprocess(pixels: &RgbImage, size: usize) -> candle_core::Result<Tensor> {
    let resized = image::imageops::resize(pixels, size as u32, size as u32, FilterType::CatmullRom);

    let data = Tensor::from_vec(resized.into_raw(), (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;

    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

/// Reads a checkpoint's `config.json`.
///
/// Falls back to the large captioning layout when the file is missing or not
/// in the shape candle expects.
fn model_config(raw: Option<&[u8]>) -> blip::Config {
    match raw.map(serde_json::from_slice::<blip::Config>) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            warn!("config.json not usable ({e}), assuming the large captioning layout");
            blip::Config::image_captioning_large()
        }
        None => {
            warn!("no config.json in repository, assuming the large captioning layout");
            blip::Config::image_captioning_large()
        }
    }
}

struct BlipModel {
    // The text decoder keeps a KV cache that generation mutates, so
    // concurrent requests take turns on the model.
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    image_size: usize,
    max_caption_tokens: usize,
}

impl BlipModel {
    fn generate(&self, image: &DecodedImage) -> Result<String, CaptionError> {
        let token_ids = self.generate_ids(image)?;
        self.tokenizer
            .decode(&token_ids, true)
            .map_err(|e| CaptionError::Inference(format!("failed to detokenize caption: {e}")))
    }

    /// Greedy decoding from `[DEC]`; the start token is not returned.
    fn generate_ids(&self, image: &DecodedImage) -> Result<Vec<u32>, CaptionError> {
        let pixel_values = preprocess(image.as_rgb(), self.image_size)
            .and_then(|t| t.to_device(&self.device))
            .and_then(|t| t.unsqueeze(0))
            .map_err(inference)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| CaptionError::Inference("model lock poisoned".to_string()))?;
        model.reset_kv_cache();

        let image_embeds = pixel_values.apply(model.vision_model()).map_err(inference)?;

        let mut logits_processor = LogitsProcessor::new(SAMPLING_SEED, None, None);
        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..self.max_caption_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(inference)?;

            let logits = model
                .text_decoder()
                .forward(&input_ids, &image_embeds)
                .and_then(|l| l.squeeze(0))
                .map_err(inference)?;
            let last = logits
                .dim(0)
                .and_then(|len| logits.get(len - 1))
                .map_err(inference)?;

            let token = logits_processor.sample(&last).map_err(inference)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        drop(model);

        token_ids.remove(0);
        Ok(token_ids)
    }
}

fn inference(err: candle_core::Error) -> CaptionError {
    CaptionError::Inference(err.to_string())
}

/// BLIP conditional-generation model with greedy decoding.
#[derive(Clone)]
pub struct BlipEngine {
    inner: Arc<BlipModel>,
}

impl BlipEngine {
    /// Fetches weights and tokenizer from the Hugging Face hub (or its local
    /// cache) and builds the model. Blocking.
    pub fn load(config: &BlipConfig) -> anyhow::Result<Self> {
        let device = select_device(config.device)?;
        info!(
            model = %config.model_id,
            revision = %config.revision,
            device = ?device,
            "loading BLIP captioning model"
        );

        let api = Api::new().context("failed to create Hugging Face hub client")?;
        let repo = api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.revision.clone(),
        ));
        let weights = repo
            .get("model.safetensors")
            .with_context(|| format!("failed to fetch weights for {}", config.model_id))?;
        let tokenizer_file = api
            .model(config.model_id.clone())
            .get("tokenizer.json")
            .with_context(|| format!("failed to fetch tokenizer for {}", config.model_id))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", tokenizer_file.display()))?;

        let raw_config = match repo.get("config.json") {
            Ok(path) => std::fs::read(&path).ok(),
            Err(e) => {
                warn!("failed to fetch config.json for {}: {e}", config.model_id);
                None
            }
        };
        let blip_config = model_config(raw_config.as_deref());
        // SAFETY: the safetensors file lives in the hub cache and is not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = blip::BlipForConditionalGeneration::new(&blip_config, vb)
            .context("failed to build BLIP model from weights")?;

        info!("BLIP model ready");
        Ok(Self {
            inner: Arc::new(BlipModel {
                model: Mutex::new(model),
                tokenizer,
                device,
                image_size: blip_config.vision_config.image_size,
                max_caption_tokens: config.max_caption_tokens.max(1),
            }),
        })
    }
}

#[async_trait]
impl CaptioningEngine for BlipEngine {
    fn name(&self) -> &str {
        "blip"
    }

    async fn caption(&self, image: DecodedImage) -> Result<String, CaptionError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.generate(&image))
            .await
            .map_err(|e| CaptionError::Inference(format!("inference worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use image::Rgb;

    const TINY_VOCAB: usize = 30524;
    const CAT: u32 = 5;
    const PAD: u32 = 0;

    const TINY_CONFIG: &str = r#"{
        "text_config": {
            "vocab_size": 30524,
            "hidden_size": 8,
            "encoder_hidden_size": 8,
            "intermediate_size": 16,
            "projection_dim": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "max_position_embeddings": 64,
            "hidden_act": "gelu",
            "layer_norm_eps": 1e-12,
            "is_decoder": true
        },
        "vision_config": {
            "hidden_size": 8,
            "intermediate_size": 16,
            "projection_dim": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "image_size": 32,
            "patch_size": 16,
            "hidden_act": "gelu",
            "layer_norm_eps": 1e-5
        },
        "projection_dim": 8,
        "image_text_hidden_size": 8
    }"#;

    const TINY_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 102, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 30522, "content": "[DEC]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[PAD]": 0, "[UNK]": 1, "cat": 5, "dog": 6, "[SEP]": 102, "[DEC]": 30522},
            "unk_token": "[UNK]"
        }
    }"#;

    /// Randomly initialised one-layer model. With `favour`, the LM head bias
    /// makes that token win every step.
    fn tiny_model(max_caption_tokens: usize, favour: Option<u32>) -> BlipModel {
        let config = model_config(Some(TINY_CONFIG.as_bytes()));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = blip::BlipForConditionalGeneration::new(&config, vb).unwrap();

        if let Some(token) = favour {
            let mut bias = vec![0f32; TINY_VOCAB];
            bias[token as usize] = 1e4;
            let bias = Tensor::from_vec(bias, TINY_VOCAB, &Device::Cpu).unwrap();

            let vars = varmap.data().lock().unwrap();
            let mut patched = 0;
            for var in vars.values() {
                if var.dims() == [TINY_VOCAB] {
                    var.set(&bias).unwrap();
                    patched += 1;
                }
            }
            assert_eq!(patched, 1, "expected a single LM head bias");
        }

        BlipModel {
            model: Mutex::new(model),
            tokenizer: Tokenizer::from_bytes(TINY_TOKENIZER.as_bytes()).unwrap(),
            device: Device::Cpu,
            image_size: config.vision_config.image_size,
            max_caption_tokens,
        }
    }

    fn red_pixel() -> DecodedImage {
        DecodedImage::from_rgb(RgbImage::from_pixel(1, 1, Rgb([255, 0, 0])))
    }

    #[test]
    fn preprocess_produces_normalized_chw() {
        let red = RgbImage::from_pixel(10, 7, Rgb([255, 0, 0]));
        let tensor = preprocess(&red, DEFAULT_IMAGE_SIZE).unwrap();

        assert_eq!(tensor.dims(), &[3, DEFAULT_IMAGE_SIZE, DEFAULT_IMAGE_SIZE]);

        let r = tensor.get(0).unwrap().get(5).unwrap().get(5).unwrap();
        let g = tensor.get(1).unwrap().get(5).unwrap().get(5).unwrap();
        let r = r.to_scalar::<f32>().unwrap();
        let g = g.to_scalar::<f32>().unwrap();

        assert!((r - (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0]).abs() < 1e-4);
        assert!((g - (0.0 - IMAGE_MEAN[1]) / IMAGE_STD[1]).abs() < 1e-4);
    }

    #[test]
    fn cpu_preference_is_honoured() {
        assert!(matches!(
            select_device(DevicePreference::Cpu).unwrap(),
            Device::Cpu
        ));
    }

    #[test]
    fn checkpoint_config_is_read_when_usable() {
        let config = model_config(Some(TINY_CONFIG.as_bytes()));
        assert_eq!(config.vision_config.image_size, 32);
        assert_eq!(config.text_config.vocab_size, TINY_VOCAB);

        let fallback = model_config(Some(b"{\"architectures\": []}"));
        assert_eq!(fallback.vision_config.image_size, DEFAULT_IMAGE_SIZE);
        let fallback = model_config(None);
        assert_eq!(fallback.vision_config.image_size, DEFAULT_IMAGE_SIZE);
    }

    #[test]
    fn generation_stops_at_token_limit() {
        let model = tiny_model(3, Some(CAT));

        assert_eq!(model.generate_ids(&red_pixel()).unwrap(), vec![CAT; 3]);
        assert_eq!(model.generate(&red_pixel()).unwrap(), "cat cat cat");
    }

    #[test]
    fn generation_stops_at_sep() {
        let model = tiny_model(8, Some(SEP_TOKEN_ID));

        assert!(model.generate_ids(&red_pixel()).unwrap().is_empty());
        assert_eq!(model.generate(&red_pixel()).unwrap(), "");
    }

    #[test]
    fn special_tokens_are_left_out_of_the_text() {
        let model = tiny_model(4, Some(PAD));

        assert_eq!(model.generate_ids(&red_pixel()).unwrap(), vec![PAD; 4]);
        let text = model.generate(&red_pixel()).unwrap();
        assert!(!text.contains("[PAD]"));
        assert!(!text.contains("[DEC]"));
        assert_eq!(text, "");
    }

    #[test]
    fn repeated_generation_is_identical() {
        let model = tiny_model(6, None);
        let image = DecodedImage::from_rgb(RgbImage::from_fn(5, 5, |x, y| {
            Rgb([(x * 50) as u8, (y * 50) as u8, 128])
        }));

        let first = model.generate_ids(&image).unwrap();
        let second = model.generate_ids(&image).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            model.generate(&image).unwrap(),
            model.generate(&image).unwrap()
        );
    }
}
