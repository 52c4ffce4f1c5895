use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn tensor_to_image_is_channel_first() -> Result<()> {
        // red plane 255, green 0, blue 10, 2x4 image
        let planes: Vec<u8> = [255u8, 0, 10]
            .iter()
            .flat_map(|&v| std::iter::repeat(v).take(8))
            .collect();
        let t = Tensor::from_vec(planes, (3, 2, 4), &Device::Cpu)?;
        let img = tensor_to_image(&t)?;
        assert_eq!(img.dimensions(), (4, 2));
        assert_eq!(img.get_pixel(3, 1).0, [255, 0, 10, 255]);
        Ok(())
    }

    #[test]
    fn tensor_to_image_rejects_grayscale() {
        let t = Tensor::zeros((1, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
    }

    #[test]
    fn force_cpu_selects_cpu() {
        assert!(select_best_device(DeviceMap::ForceCpu).unwrap().is_cpu());
    }
}
