//! In-process JPEG encoding of raw RGB frames

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};

use crate::streaming::{EncodeError, EncodedImage, FrameEncoder, RawImage};

pub struct JpegEncoder {
    quality: u8,
    scale: f64,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            scale: 1.0,
        }
    }

    /// Downscale by `scale` (0 < scale <= 1) before encoding
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.scale >= 1.0 {
            return (width, height);
        }
        let scale = |v: u32| ((v as f64 * self.scale).round() as u32).max(1);
        (scale(width), scale(height))
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, raw: &RawImage) -> Result<EncodedImage, EncodeError> {
        if raw.width == 0 || raw.height == 0 {
            return Err(EncodeError::Dimensions(raw.width, raw.height));
        }

        let expected = raw.width as usize * raw.height as usize * 3;
        if raw.data.len() != expected {
            return Err(EncodeError::BufferSize {
                width: raw.width,
                height: raw.height,
                expected,
                actual: raw.data.len(),
            });
        }

        let (width, height) = self.target_size(raw.width, raw.height);
        let mut out = Vec::with_capacity(expected / 8);
        {
            let mut encoder = ImageJpegEncoder::new_with_quality(&mut out, self.quality);
            let result = if (width, height) == (raw.width, raw.height) {
                encoder.encode(&raw.data, width, height, ExtendedColorType::Rgb8)
            } else {
                let image = RgbImage::from_raw(raw.width, raw.height, raw.data.to_vec())
                    .ok_or(EncodeError::Dimensions(raw.width, raw.height))?;
                let resized = imageops::resize(&image, width, height, FilterType::Triangle);
                encoder.encode(resized.as_raw(), width, height, ExtendedColorType::Rgb8)
            };
            result.map_err(|e| EncodeError::Jpeg(e.to_string()))?;
        }

        Ok(EncodedImage {
            data: out.into(),
            width: Some(width),
            height: Some(height),
        })
    }
}
