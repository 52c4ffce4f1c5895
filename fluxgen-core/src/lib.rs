pub mod device_map;
mod error;
pub mod exif;
mod flux;
mod generator;
pub mod loader;
mod loader_factory;
pub mod output;
pub mod safety;
mod util;

pub use device_map::*;
pub use error::{Error, Result};
pub use flux::{FluxLoader, FluxModel, FluxVariant};
pub use generator::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use safety::{SafetyClassifier, VitSafetyClassifier, NSFW_MESSAGE, NSFW_THRESHOLD};
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// Seed value asking the generator to draw a fresh random seed.
pub const RANDOM_SEED: i64 = -1;

/// Width and height must be multiples of this (latents are 1/8 scale, packed 2x2).
pub const SIZE_MULTIPLE: usize = 16;
pub const MAX_SIZE: usize = 8192;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance: f64,
    #[serde(default = "default_seed")]
    pub seed: i64,
    pub prompt: String,
    #[serde(default = "default_add_sampling_metadata")]
    pub add_sampling_metadata: bool,
}

fn default_width() -> usize {
    1360
}

fn default_height() -> usize {
    768
}

fn default_num_steps() -> usize {
    4
}

fn default_guidance() -> f64 {
    3.5
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

fn default_add_sampling_metadata() -> bool {
    true
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            num_steps: default_num_steps(),
            guidance: default_guidance(),
            seed: default_seed(),
            prompt: prompt.into(),
            add_sampling_metadata: default_add_sampling_metadata(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > MAX_SIZE || value % SIZE_MULTIPLE != 0 {
                return Err(Error::InvalidRequest(format!(
                    "{name} must be a positive multiple of {SIZE_MULTIPLE} no larger than {MAX_SIZE}, got {value}"
                )));
            }
        }
        if self.num_steps == 0 {
            return Err(Error::InvalidRequest("num_steps must be at least 1".into()));
        }
        if !self.guidance.is_finite() {
            return Err(Error::InvalidRequest("guidance must be a finite number".into()));
        }
        if self.seed < RANDOM_SEED {
            return Err(Error::InvalidRequest(format!(
                "seed must be {RANDOM_SEED} (random) or non-negative, got {}",
                self.seed
            )));
        }
        Ok(())
    }
}

/// A request with its seed resolved, as handed to a model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_steps: usize,
    pub guidance: f64,
    pub seed: u64,
}

impl SamplingOptions {
    pub fn new(request: &GenerationRequest, seed: u64) -> Self {
        Self {
            prompt: request.prompt.clone(),
            width: request.width,
            height: request.height,
            num_steps: request.num_steps,
            guidance: request.guidance,
            seed,
        }
    }
}

/// Text-to-image backend. Runs noise init, text conditioning, denoising and decoding.
///
/// Backends own device state and are not reentrant, hence `&mut self`; the
/// [`Generator`] serialises access.
pub trait ModelLike: Send {
    fn run(&mut self, options: &SamplingOptions) -> anyhow::Result<DynamicImage>;
}
