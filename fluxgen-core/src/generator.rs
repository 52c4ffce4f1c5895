use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use rand::Rng;

use crate::output::{self, ImageMetadata};
use crate::{
    GenerationRequest, ModelLike, Result, SafetyClassifier, SamplingOptions, NSFW_MESSAGE,
    NSFW_THRESHOLD, RANDOM_SEED,
};

/// An accepted image, already written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub seed: u64,
    pub path: PathBuf,
    /// The JPEG bytes that were written to `path`.
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Image(GeneratedImage),
    /// The safety classifier withheld the image. Nothing was written.
    Rejected { seed: u64, message: String },
}

impl GenerationResult {
    pub fn seed(&self) -> u64 {
        match self {
            GenerationResult::Image(image) => image.seed,
            GenerationResult::Rejected { seed, .. } => *seed,
        }
    }
}

/// Draws a random seed for [`RANDOM_SEED`], otherwise passes the seed through.
///
/// Random seeds stay within `i64` so they can be sent back as a request seed.
pub fn resolve_seed(seed: i64) -> u64 {
    if seed == RANDOM_SEED {
        rand::thread_rng().gen_range(0..=i64::MAX as u64)
    } else {
        seed as u64
    }
}

struct Pipeline {
    model: Box<dyn ModelLike>,
    safety: Box<dyn SafetyClassifier>,
}

/// The loaded model components for one model, shared by every request.
///
/// Calls are serialised: a second caller blocks until the running generation
/// finishes. Callers on an async runtime should go through `spawn_blocking`.
pub struct Generator {
    model_name: String,
    output_dir: PathBuf,
    pipeline: Mutex<Pipeline>,
}

impl Generator {
    pub fn new(
        model_name: impl Into<String>,
        model: Box<dyn ModelLike>,
        safety: Box<dyn SafetyClassifier>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            output_dir: output_dir.into(),
            pipeline: Mutex::new(Pipeline { model, safety }),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        request.validate()?;
        let seed = resolve_seed(request.seed);
        let options = SamplingOptions::new(request, seed);
        tracing::info!(
            "Generating with {} {}x{} steps={} guidance={} seed={}",
            self.model_name,
            options.width,
            options.height,
            options.num_steps,
            options.guidance,
            seed
        );

        let (image, nsfw_score) = {
            // A panic mid-generation leaves nothing half-updated that later calls rely on.
            let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
            let start = Instant::now();
            let image = pipeline.model.run(&options)?;
            tracing::info!("Done in {:.1}s.", start.elapsed().as_secs_f32());
            let nsfw_score = pipeline.safety.nsfw_score(&image)?;
            (image, nsfw_score)
        };

        if nsfw_score >= NSFW_THRESHOLD {
            tracing::warn!("Withholding image for seed {seed} (nsfw score {nsfw_score:.3})");
            return Ok(GenerationResult::Rejected {
                seed,
                message: NSFW_MESSAGE.to_string(),
            });
        }

        let prompt = request
            .add_sampling_metadata
            .then_some(request.prompt.as_str());
        let metadata = ImageMetadata::txt2img(&self.model_name, prompt);
        let (path, jpeg) = output::save_image(&self.output_dir, &image, &metadata)?;
        tracing::info!("Saved {}", path.display());

        Ok(GenerationResult::Image(GeneratedImage { seed, path, jpeg }))
    }
}
