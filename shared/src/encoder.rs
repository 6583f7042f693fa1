//! JPEG encoding of captured frames.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("cannot encode an empty {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// Resizes (optionally) and compresses a raw RGB frame into a JPEG payload.
///
/// Stateless: the same input always produces the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder {
    resize: Option<(u32, u32)>,
    quality: u8,
}

impl FrameEncoder {
    /// Quality is clamped to `1..=100`.
    pub fn new(resize: Option<(u32, u32)>, quality: u8) -> Self {
        Self {
            resize,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn resize(&self) -> Option<(u32, u32)> {
        self.resize
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, CodecError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(CodecError::EmptyImage { width, height });
        }

        match self.resize {
            Some((w, h)) if (w, h) != (width, height) => {
                if w == 0 || h == 0 {
                    return Err(CodecError::EmptyImage { width: w, height: h });
                }
                let resized = imageops::resize(image, w, h, FilterType::Triangle);
                self.compress(&resized)
            }
            _ => self.compress(image),
        }
    }

    fn compress(&self, image: &RgbImage) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(image)?;
        Ok(buffer)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(None, DEFAULT_JPEG_QUALITY)
    }
}

/// Decode any supported compressed image (JPEG, PNG) into RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, CodecError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}
