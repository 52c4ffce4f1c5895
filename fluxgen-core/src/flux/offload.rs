use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;

type Build<T> = Box<dyn Fn(VarBuilder) -> candle_core::Result<T> + Send>;

/// A pipeline component that is either kept resident on the execution device or
/// only materialised there while its stage runs.
///
/// Offloaded components stay as memory-mapped safetensors on the host between
/// uses, which bounds accelerator memory to the largest single component.
pub struct Stage<T> {
    name: &'static str,
    weights: Vec<PathBuf>,
    dtype: DType,
    device: Device,
    offload: bool,
    build: Build<T>,
    resident: Option<T>,
}

impl<T> Stage<T> {
    pub fn new(
        name: &'static str,
        weights: Vec<PathBuf>,
        dtype: DType,
        device: &Device,
        offload: bool,
        build: impl Fn(VarBuilder) -> candle_core::Result<T> + Send + 'static,
    ) -> Result<Self> {
        let mut stage = Self {
            name,
            weights,
            dtype,
            device: device.clone(),
            offload,
            build: Box::new(build),
            resident: None,
        };
        if !offload {
            stage.acquire()?;
        }
        Ok(stage)
    }

    fn materialise(&self) -> Result<T> {
        tracing::debug!("Loading {} onto {:?}", self.name, self.device);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&self.weights, self.dtype, &self.device)
                .with_context(|| format!("failed to build {} var builder", self.name))?
        };
        (self.build)(vb).with_context(|| format!("failed to load {}", self.name))
    }

    /// Returns the component, loading it onto the device first if it was offloaded.
    pub fn acquire(&mut self) -> Result<&mut T> {
        let component = match self.resident.take() {
            Some(component) => component,
            None => self.materialise()?,
        };
        Ok(self.resident.insert(component))
    }

    /// Drops the device copy when offloading; a no-op for resident components.
    pub fn release(&mut self) {
        if self.offload && self.resident.take().is_some() {
            tracing::debug!("Offloaded {}", self.name);
        }
    }

    #[cfg(test)]
    fn is_resident(&self) -> bool {
        self.resident.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use candle_core::Tensor;

    fn weights_file() -> PathBuf {
        let path = std::env::temp_dir().join(format!("fluxgen-stage-{}.safetensors", uuid::Uuid::new_v4()));
        let tensors = HashMap::from([(
            "w".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    fn counting_stage(offload: bool) -> (Stage<Tensor>, Arc<AtomicUsize>, PathBuf) {
        let path = weights_file();
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let stage = Stage::new("test", vec![path.clone()], DType::F32, &Device::Cpu, offload, move |vb| {
            counter.fetch_add(1, Ordering::SeqCst);
            vb.get((2, 2), "w")
        })
        .unwrap();
        (stage, loads, path)
    }

    #[test]
    fn resident_stage_loads_once() {
        let (mut stage, loads, path) = counting_stage(false);
        assert!(stage.is_resident());
        stage.acquire().unwrap();
        stage.release();
        stage.acquire().unwrap();
        assert!(stage.is_resident());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn offloaded_stage_loads_per_use() {
        let (mut stage, loads, path) = counting_stage(true);
        assert!(!stage.is_resident());
        let w = stage.acquire().unwrap();
        assert_eq!(w.sum_all().unwrap().to_scalar::<f32>().unwrap(), 4.0);
        stage.release();
        assert!(!stage.is_resident());
        stage.acquire().unwrap();
        stage.release();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        std::fs::remove_file(path).unwrap();
    }
}
