use candle_core::{Device, Result, Tensor};
use candle_transformers::models::flux;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use super::FluxVariant;

const LATENT_CHANNELS: usize = 16;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

/// Latent noise of shape (1, 16, 2 * ceil(h / 16), 2 * ceil(w / 16)).
///
/// Drawn on the host from a seeded rng so a seed reproduces the same noise on
/// every device; the CPU backend cannot be seeded through candle.
pub fn get_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let len = LATENT_CHANNELS * height * width;
    let noise: Vec<f32> = StandardNormal.sample_iter(&mut rng).take(len).collect();
    Tensor::from_vec(noise, (1, LATENT_CHANNELS, height, width), device)
}

/// Timesteps for `num_steps` of denoising. Dev shifts the schedule towards high
/// noise as the packed image sequence grows; schnell is distilled for the plain one.
pub fn get_schedule(variant: FluxVariant, num_steps: usize, image_seq_len: usize) -> Vec<f64> {
    match variant {
        FluxVariant::Schnell => flux::sampling::get_schedule(num_steps, None),
        FluxVariant::Dev => {
            flux::sampling::get_schedule(num_steps, Some((image_seq_len, BASE_SHIFT, MAX_SHIFT)))
        }
    }
}
