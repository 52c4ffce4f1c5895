use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{self, ClipTextConfig, ClipTextTransformer},
    flux::{
        self,
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

mod offload;
mod sampling;

use offload::Stage;

use crate::{select_best_device, tensor_to_image, LoadOptions, Loader, ModelLike, SamplingOptions};

const CLIP_MAX_LENGTH: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FluxVariant {
    #[serde(rename = "flux-schnell")]
    Schnell,
    #[serde(rename = "flux-dev")]
    Dev,
}

serde_plain::derive_display_from_serialize!(FluxVariant);
serde_plain::derive_fromstr_from_deserialize!(FluxVariant);

impl FluxVariant {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights_file(&self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    /// Prompt length the T5 encoder is padded or truncated to.
    pub fn t5_max_length(&self) -> usize {
        match self {
            Self::Schnell => 256,
            Self::Dev => 512,
        }
    }

    pub fn default_steps(&self) -> usize {
        match self {
            Self::Schnell => 4,
            Self::Dev => 50,
        }
    }

    /// Schnell is guidance-distilled and ignores the guidance scale.
    pub fn uses_guidance(&self) -> bool {
        matches!(self, Self::Dev)
    }

    fn model_config(&self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_tokenizer: Tokenizer,
    clip_tokenizer: Tokenizer,
    t5_model: Stage<T5EncoderModel>,
    clip_model: Stage<ClipTextTransformer>,
    flux_model: Stage<Flux>,
    autoencoder: Stage<AutoEncoder>,
}

impl FluxModel {
    /// Returns the (T5, CLIP) prompt embeddings.
    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        // --- Compute T5 embedding ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(self.variant.t5_max_length(), 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.acquire()?.forward(&input_token_ids)?;
        self.t5_model.release();

        // --- Compute CLIP embedding ---
        let mut clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if clip_tokens.len() > CLIP_MAX_LENGTH {
            // keep the end-of-text token, pooling reads from it
            let eot = clip_tokens[clip_tokens.len() - 1];
            clip_tokens.truncate(CLIP_MAX_LENGTH - 1);
            clip_tokens.push(eot);
        }
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.acquire()?.forward(&input_token_ids_clip)?;
        self.clip_model.release();

        Ok((t5_emb, clip_emb))
    }
}

impl ModelLike for FluxModel {
    fn run(&mut self, options: &SamplingOptions) -> Result<DynamicImage> {
        let (width, height) = (options.width, options.height);

        // --- Generate noise image ---
        let noise_img =
            sampling::get_noise(options.seed, height, width, &self.device)?.to_dtype(self.dtype)?;

        // --- Text conditioning ---
        let (t5_emb, clip_emb) = self.encode_prompt(&options.prompt)?;
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps =
            sampling::get_schedule(self.variant, options.num_steps, state.img.dim(1)?);

        // --- Denoise ---
        let flux_model = self.flux_model.acquire()?;
        let latent_img = flux::sampling::denoise(
            &*flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            options.guidance,
        )?;
        self.flux_model.release();
        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;
        tracing::debug!("Generated latent image");

        // --- Decode the latent image ---
        let decoded = self.autoencoder.acquire()?.decode(&unpacked)?;
        self.autoencoder.release();
        tracing::debug!("Decoded image");

        // --- Postprocessing: clamp, scale, convert type ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        tensor_to_image(&img_tensor)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Variant = FluxVariant;
    type Model = FluxModel;

    async fn load(variant: FluxVariant, api: Api, options: LoadOptions) -> Result<Self::Model> {
        // Configure device.
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        let offload = options.offload;
        tracing::info!("Loading {variant} on {device:?} ({dtype:?}, offload: {offload})");

        // --- T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model = Stage::new(
            "T5 encoder",
            vec![t5_model_file],
            dtype,
            &device,
            offload,
            move |vb| T5EncoderModel::load(vb, &t5_config),
        )?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: CLIP_MAX_LENGTH,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = Stage::new(
            "CLIP encoder",
            vec![clip_model_file],
            dtype,
            &device,
            offload,
            move |vb| ClipTextTransformer::new(vb.pp("text_model"), &clip_config),
        )?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_config = variant.autoencoder_config();
        let autoencoder = Stage::new(
            "autoencoder",
            vec![autoencoder_model_file],
            dtype,
            &device,
            offload,
            move |vb| AutoEncoder::new(&autoencoder_config, vb),
        )?;

        // --- Flux Model (non-quantized) ---
        let flux_model_file = bf_repo
            .get(variant.weights_file())
            .await
            .context("failed to get flux model file")?;
        let flux_config = variant.model_config();
        let flux_model = Stage::new(
            "flux transformer",
            vec![flux_model_file],
            dtype,
            &device,
            offload,
            move |vb| Flux::new(&flux_config, vb),
        )?;

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_tokenizer,
            clip_tokenizer,
            t5_model,
            clip_model,
            flux_model,
            autoencoder,
        })
    }
}
