use image::ImageReader;
use image::imageops::FilterType;
use ndarray::Array3;
use sha2::{Digest, Sha256};
use std::io::Cursor;

use crate::config::ImageConfig;
use crate::imaging::ImageArray;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Image file is too large ({size} bytes). Maximum size is {max} bytes.")]
    TooLarge { size: usize, max: usize },
    #[error("Image file is empty")]
    Empty,
    #[error("Invalid image file: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image dimensions {width}x{height} are outside the accepted range {min}..={max} pixels")]
    Dimensions {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },
    #[error("Unexpected pixel buffer shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Decodes uploads into the normalized (H, W, 3) array the analysis expects.
#[derive(Clone)]
pub struct ImageProcessor {
    config: ImageConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }

    pub fn max_bytes(&self) -> usize {
        self.config.max_bytes
    }

    pub fn calculate_image_hash(image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_data);
        hex::encode(hasher.finalize())
    }

    /// Short form of the image hash used to correlate log lines.
    pub fn fingerprint(image_data: &[u8]) -> String {
        let mut hash = Self::calculate_image_hash(image_data);
        hash.truncate(12);
        hash
    }

    pub fn validate(&self, image_data: &[u8]) -> Result<(u32, u32), IntakeError> {
        if image_data.is_empty() {
            return Err(IntakeError::Empty);
        }
        if image_data.len() > self.config.max_bytes {
            return Err(IntakeError::TooLarge {
                size: image_data.len(),
                max: self.config.max_bytes,
            });
        }

        let (width, height) = ImageReader::new(Cursor::new(image_data))
            .with_guessed_format()?
            .into_dimensions()?;

        let range = self.config.min_dimension..=self.config.max_dimension;
        if !range.contains(&width) || !range.contains(&height) {
            return Err(IntakeError::Dimensions {
                width,
                height,
                min: self.config.min_dimension,
                max: self.config.max_dimension,
            });
        }
        Ok((width, height))
    }

    pub fn process(&self, image_data: &[u8]) -> Result<ImageArray, IntakeError> {
        self.validate(image_data)?;

        let decoded = image::load_from_memory(image_data)?.to_rgb8();
        let size = self.config.input_size;
        let resized = image::imageops::resize(&decoded, size, size, FilterType::Lanczos3);

        let pixels: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|v| v as f32 / 255.0)
            .collect();
        let array = Array3::from_shape_vec((size as usize, size as usize, 3), pixels)?;
        Ok(array)
    }
}
