use std::path::PathBuf;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{FluxLoader, FluxVariant, Generator, LoadOptions, Loader, ModelLike, VitSafetyClassifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        if let Ok(variant) = model_name.parse::<FluxVariant>() {
            return Some(ModelVariant::Flux(variant));
        }

        let name_upper = model_name.to_uppercase();
        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                FluxVariant::Schnell // Default to Schnell if no specific variant is found
            }))
        } else {
            None
        }
    }

    pub fn default_steps(&self) -> usize {
        match self {
            ModelVariant::Flux(variant) => variant.default_steps(),
        }
    }

    pub fn uses_guidance(&self) -> bool {
        match self {
            ModelVariant::Flux(variant) => variant.uses_guidance(),
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    options: LoadOptions,
) -> Result<Box<dyn ModelLike>> {
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!("Loading model: {model_name} (detected variant: {model_variant:?})");

    match model_variant {
        ModelVariant::Flux(variant) => {
            let model = FluxLoader::load(variant, api, options).await?;
            Ok(Box::new(model))
        }
    }
}

/// Loads `model_name` plus the safety classifier and wraps them in a [`Generator`].
pub async fn load_generator(
    model_name: &str,
    api: Api,
    options: LoadOptions,
    output_dir: impl Into<PathBuf>,
) -> Result<Generator> {
    let model = load_model(model_name, api.clone(), options).await?;
    let safety = VitSafetyClassifier::load(&api, options.device_map).await?;
    Ok(Generator::new(model_name, model, Box::new(safety), output_dir))
}
