use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array2, ArrayView2, ArrayView3, Zip, s};

use crate::imaging::color::{self, HsvRange, LayoutError};

pub const DEFAULT_EDGE_DENSITY: f32 = 0.15;
pub const DEFAULT_TEXTURE_VARIANCE: f32 = 500.0;
const NO_CONTOUR_AREA: f32 = 0.3;

const RED_RANGES: [HsvRange; 2] = [
    HsvRange::new([0, 50, 50], [10, 255, 255]),
    HsvRange::new([170, 50, 50], [180, 255, 255]),
];
const REDNESS_SCALE: f32 = 3.0;
const AREA_SCALE: f32 = 2.0;

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

// Gaussian weighting of an 11x11 neighbourhood: sigma = 0.3 * ((11 - 1) / 2 - 1) + 0.8
const ADAPTIVE_SIGMA: f32 = 2.0;
const ADAPTIVE_OFFSET: f32 = 2.0;

// clockwise from top-left; bit k is set when neighbour k >= centre
const LBP_NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    EdgeDensity,
    TextureVariance,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeatureError {
    #[error("Image format not suitable for analysis: {0}")]
    Layout(#[from] LayoutError),
    #[error("Image of {width}x{height} is too small to measure {feature:?}")]
    TooSmall {
        feature: Feature,
        width: u32,
        height: u32,
    },
    #[error("Unexpected pixel buffer shape: {0}")]
    Shape(String),
}

/// Visual evidence measured from one image.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualFeatures {
    /// Share of red pixels, scaled by 3 and capped at 1.
    pub redness_ratio: f32,
    /// Unscaled share of red pixels.
    pub red_fraction: f32,
    pub edge_density: f32,
    pub texture_variance: f32,
    pub affected_area_ratio: f32,
    fallbacks: Vec<Feature>,
}

pub type Extraction = Result<VisualFeatures, FeatureError>;

impl VisualFeatures {
    pub fn new(
        red_fraction: f32,
        edge_density: f32,
        texture_variance: f32,
        affected_area_ratio: f32,
    ) -> Self {
        Self {
            redness_ratio: (red_fraction * REDNESS_SCALE).min(1.0),
            red_fraction,
            edge_density,
            texture_variance,
            affected_area_ratio,
            fallbacks: Vec::new(),
        }
    }

    /// False when the value is a documented default standing in for a failed measurement.
    pub fn is_measured(&self, feature: Feature) -> bool {
        !self.fallbacks.contains(&feature)
    }

    pub fn fallbacks(&self) -> &[Feature] {
        &self.fallbacks
    }

    /// Texture variance mapped onto [0, 1] (typical variance tops out around 1000).
    pub fn texture_irregularity(&self) -> f32 {
        (self.texture_variance / 1000.0).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Fails only when the pixel layout is unusable; individual measurements
    /// that fail fall back to their defaults.
    pub fn extract(&self, image: ArrayView3<f32>) -> Extraction {
        let rgb = color::to_rgb8(image)?;
        let gray = color::to_gray(&rgb);
        let mut fallbacks = Vec::new();

        let red_fraction = color::hsv_mask_fraction(&rgb, &RED_RANGES);

        let edge_density = edge_density(&gray).unwrap_or_else(|e| {
            log::warn!("Edge density unavailable, using default: {}", e);
            fallbacks.push(Feature::EdgeDensity);
            DEFAULT_EDGE_DENSITY
        });

        let texture_variance = texture_variance(&gray).unwrap_or_else(|e| {
            log::warn!("Texture variance unavailable, using default: {}", e);
            fallbacks.push(Feature::TextureVariance);
            DEFAULT_TEXTURE_VARIANCE
        });

        let affected_area_ratio = affected_area_ratio(&gray);

        let mut features = VisualFeatures::new(
            red_fraction,
            edge_density,
            texture_variance,
            affected_area_ratio,
        );
        features.fallbacks = fallbacks;
        Ok(features)
    }
}

pub fn edge_density(gray: &GrayImage) -> Result<f32, FeatureError> {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return Err(FeatureError::TooSmall {
            feature: Feature::EdgeDensity,
            width,
            height,
        });
    }
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let marked = edges.as_raw().iter().filter(|&&v| v > 0).count();
    Ok(marked as f32 / (width as f32 * height as f32))
}

/// Radius-1, 8-neighbour local binary pattern codes; border pixels keep code 0.
pub fn lbp_codes(gray: &GrayImage) -> Result<Array2<u8>, FeatureError> {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return Err(FeatureError::TooSmall {
            feature: Feature::TextureVariance,
            width,
            height,
        });
    }
    let (h, w) = (height as usize, width as usize);
    let pixels = ArrayView2::from_shape((h, w), gray.as_raw().as_slice())
        .map_err(|e| FeatureError::Shape(e.to_string()))?;

    let mut codes = Array2::<u8>::zeros((h, w));
    let (hi, wi) = (h as isize, w as isize);
    let centre = pixels.slice(s![1..hi - 1, 1..wi - 1]);
    let mut inner = codes.slice_mut(s![1..hi - 1, 1..wi - 1]);

    for (bit, &(dy, dx)) in LBP_NEIGHBOURS.iter().enumerate() {
        let neighbour = pixels.slice(s![1 + dy..hi - 1 + dy, 1 + dx..wi - 1 + dx]);
        let mask = 1u8 << bit;
        Zip::from(&mut inner)
            .and(&neighbour)
            .and(&centre)
            .for_each(|code, &n, &c| {
                if n >= c {
                    *code |= mask;
                }
            });
    }
    Ok(codes)
}

pub fn texture_variance(gray: &GrayImage) -> Result<f32, FeatureError> {
    let codes = lbp_codes(gray)?;
    let n = codes.len() as f64;
    let mean = codes.iter().map(|&c| c as f64).sum::<f64>() / n;
    let variance = codes
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Ok(variance as f32)
}

/// Share of the image covered by outer contours of an inverse adaptive threshold,
/// scaled by 2 and capped at 1.
pub fn affected_area_ratio(gray: &GrayImage) -> f32 {
    let (width, height) = gray.dimensions();
    let blurred = gaussian_blur_f32(gray, ADAPTIVE_SIGMA);
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let src = gray.get_pixel(x, y)[0] as f32;
        let threshold = blurred.get_pixel(x, y)[0] as f32 - ADAPTIVE_OFFSET;
        Luma([if src > threshold { 0 } else { 255 }])
    });

    let outer: Vec<_> = find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .collect();
    if outer.is_empty() {
        return NO_CONTOUR_AREA;
    }

    let total: f64 = outer
        .iter()
        .map(|c| polygon_area(c.points.iter().map(|p| (p.x as f64, p.y as f64))))
        .sum();
    let image_area = width as f64 * height as f64;
    ((total / image_area) as f32 * AREA_SCALE).min(1.0)
}

fn polygon_area(points: impl Iterator<Item = (f64, f64)> + Clone) -> f64 {
    let next = points.clone().cycle().skip(1);
    let twice: f64 = points
        .zip(next)
        .map(|((x0, y0), (x1, y1))| x0 * y1 - x1 * y0)
        .sum();
    twice.abs() / 2.0
}
