//! Post-generation content filter.
//!
//! Decoded images are scored by an image classifier before anything is written
//! to disk; images scoring at or above [`NSFW_THRESHOLD`] are withheld.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::vit;
use hf_hub::api::tokio::Api;
use image::{imageops::FilterType, DynamicImage};
use serde::Deserialize;

use crate::{select_best_device, DeviceMap};

pub const NSFW_THRESHOLD: f32 = 0.85;
pub const NSFW_MESSAGE: &str = "Your generated image may contain NSFW content.";

const CLASSIFIER_REPO: &str = "Falconsai/nsfw_image_detection";
const NSFW_LABEL: &str = "nsfw";
const IMAGE_SIZE: u32 = 224;

pub trait SafetyClassifier: Send {
    /// Probability in `[0, 1]` that `image` shows unsafe content.
    fn nsfw_score(&self, image: &DynamicImage) -> Result<f32>;
}

#[derive(Deserialize)]
struct ClassifierConfig {
    id2label: HashMap<String, String>,
}

/// Returns `(index of the nsfw label, number of labels)`.
fn nsfw_label_index(config: &ClassifierConfig) -> Result<(usize, usize)> {
    let num_labels = config.id2label.len();
    let index = config
        .id2label
        .iter()
        .find(|(_, label)| label.eq_ignore_ascii_case(NSFW_LABEL))
        .map(|(id, _)| id.parse::<usize>())
        .transpose()
        .context("classifier label ids must be integers")?
        .ok_or_else(|| anyhow!("classifier has no `{NSFW_LABEL}` label"))?;
    if index >= num_labels {
        anyhow::bail!("label id {index} out of range for {num_labels} labels");
    }
    Ok((index, num_labels))
}

/// Resizes to the classifier resolution and normalises to `[-1, 1]`, shape (1, 3, 224, 224).
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();
    let size = IMAGE_SIZE as usize;
    let pixels = Tensor::from_vec(rgb.into_raw(), (size, size, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    // mean 0.5, std 0.5
    Ok(pixels.affine(2.0 / 255.0, -1.0)?.unsqueeze(0)?)
}

/// ViT image classifier fine-tuned for nsfw detection.
pub struct VitSafetyClassifier {
    model: vit::Model,
    device: Device,
    nsfw_index: usize,
}

impl VitSafetyClassifier {
    pub async fn load(api: &Api, device_map: DeviceMap) -> Result<Self> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let repo = api.model(CLASSIFIER_REPO.to_string());

        let config_file = repo
            .get("config.json")
            .await
            .context("failed to get classifier config")?;
        let config: ClassifierConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_file).context("failed to read classifier config")?,
        )
        .context("failed to parse classifier config")?;
        let (nsfw_index, num_labels) = nsfw_label_index(&config)?;

        let weights = repo
            .get("model.safetensors")
            .await
            .context("failed to get classifier weights")?;
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .context("failed to build classifier var builder")?
        };
        let model = vit::Model::new(&vit::Config::vit_base_patch16_224(), num_labels, vb)
            .context("failed to load classifier")?;
        tracing::info!("Loaded safety classifier {CLASSIFIER_REPO}");

        Ok(Self {
            model,
            device,
            nsfw_index,
        })
    }
}

impl SafetyClassifier for VitSafetyClassifier {
    fn nsfw_score(&self, image: &DynamicImage) -> Result<f32> {
        let input = preprocess(image, &self.device)?;
        let logits = self.model.forward(&input)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        let score = probs
            .get(self.nsfw_index)
            .copied()
            .ok_or_else(|| anyhow!("classifier returned {} scores", probs.len()))?;
        tracing::debug!("nsfw score {score:.3}");
        Ok(score)
    }
}
