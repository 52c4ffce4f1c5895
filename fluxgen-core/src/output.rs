use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType};
use uuid::Uuid;

use crate::exif;
use crate::Result;

pub const DEFAULT_OUTPUT_DIR: &str = "output/gradio";
pub const JPEG_QUALITY: u8 = 95;

pub const SOFTWARE_TXT2IMG: &str = "AI generated;txt2img;flux";
pub const MAKE: &str = "Black Forest Labs";

const SOI: [u8; 2] = [0xff, 0xd8];
const APP0: u8 = 0xe0;
const APP1: u8 = 0xe1;
/// Largest payload an APPn segment can carry (length field counts itself).
const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize - 2;

/// Descriptive tags written into the EXIF block of every saved image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub software: String,
    pub make: String,
    pub model: String,
    pub description: Option<String>,
}

impl ImageMetadata {
    /// Tags for a text-to-image result. The prompt is only recorded when given.
    pub fn txt2img(model_name: &str, prompt: Option<&str>) -> Self {
        Self {
            software: SOFTWARE_TXT2IMG.to_string(),
            make: MAKE.to_string(),
            model: model_name.to_string(),
            description: prompt.map(str::to_string),
        }
    }

    fn to_exif(&self) -> Result<Vec<u8>> {
        let mut entries = vec![
            (exif::TAG_SOFTWARE, self.software.as_str()),
            (exif::TAG_MAKE, self.make.as_str()),
            (exif::TAG_MODEL, self.model.as_str()),
        ];
        if let Some(description) = &self.description {
            entries.push((exif::TAG_IMAGE_DESCRIPTION, description.as_str()));
        }
        let payload = exif::encode(&entries)?;
        if payload.len() <= MAX_SEGMENT_PAYLOAD {
            return Ok(payload);
        }

        // Only the description can realistically blow the segment limit.
        let description = self.description.as_deref().unwrap_or_default();
        let excess = payload.len() - MAX_SEGMENT_PAYLOAD;
        let mut keep = description.len().saturating_sub(excess + 1);
        while !description.is_char_boundary(keep) {
            keep -= 1;
        }
        tracing::warn!(
            "Truncating image description from {} to {} bytes to fit the EXIF segment",
            description.len(),
            keep
        );
        entries.pop();
        entries.push((exif::TAG_IMAGE_DESCRIPTION, &description[..keep]));
        Ok(exif::encode(&entries)?)
    }
}

/// Encodes `image` as a quality 95, 4:4:4 JPEG carrying `metadata` in an APP1 segment.
pub fn encode_jpeg(image: &DynamicImage, metadata: &ImageMetadata) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    // The encoder never subsamples chroma, every component is written at 1x1.
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    let exif = metadata.to_exif()?;
    Ok(insert_app1(&jpeg, &exif))
}

/// Places an APP1 segment after SOI and, if present, the JFIF APP0 segment.
fn insert_app1(jpeg: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut at = SOI.len();
    if jpeg.len() >= 6 && jpeg[2] == 0xff && jpeg[3] == APP0 {
        let len = u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
        at += 2 + len;
    }
    let mut out = Vec::with_capacity(jpeg.len() + payload.len() + 4);
    out.extend_from_slice(&jpeg[..at]);
    out.extend_from_slice(&[0xff, APP1]);
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&jpeg[at..]);
    out
}

/// Writes `image` to `<output_dir>/<uuid>.jpg`, creating the directory if needed.
///
/// Returns the file path together with the bytes that were written.
pub fn save_image(
    output_dir: &Path,
    image: &DynamicImage,
    metadata: &ImageMetadata,
) -> Result<(PathBuf, Vec<u8>)> {
    let jpeg = encode_jpeg(image, metadata)?;
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(format!("{}.jpg", Uuid::new_v4()));
    std::fs::write(&path, &jpeg)?;
    tracing::debug!("Saved {} ({} bytes)", path.display(), jpeg.len());
    Ok((path, jpeg))
}

/// Returns (marker, payload) for each segment before the scan data.
#[cfg(test)]
fn segments(jpeg: &[u8]) -> Vec<(u8, &[u8])> {
    let mut out = Vec::new();
    let mut pos = 2;
    while pos + 4 <= jpeg.len() && jpeg[pos] == 0xff {
        let marker = jpeg[pos + 1];
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        out.push((marker, &jpeg[pos + 4..pos + 2 + len]));
        if marker == 0xda {
            break;
        }
        pos += 2 + len;
    }
    out
}

/// Reads an ASCII EXIF tag out of an encoded JPEG.
#[cfg(test)]
pub(crate) fn read_exif_tag(jpeg: &[u8], tag: u16) -> Option<String> {
    let (_, app1) = segments(jpeg).into_iter().find(|(m, _)| *m == APP1)?;
    exif::read_ascii(app1, tag)
}
