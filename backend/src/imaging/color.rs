use image::{GrayImage, Luma, RgbImage};
use ndarray::ArrayView3;

/// An HSV triple on the 8-bit scale: hue in 0..=180, saturation and value in 0..=255.
pub type Hsv = [u8; 3];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("Image has no pixels")]
    Empty,
    #[error("Expected 1 or 3 channels, got {0}")]
    UnsupportedChannels(usize),
}

/// Inclusive HSV box, matched per channel.
#[derive(Debug, Clone, Copy)]
pub struct HsvRange {
    pub lower: Hsv,
    pub upper: Hsv,
}

impl HsvRange {
    pub const fn new(lower: Hsv, upper: Hsv) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, hsv: Hsv) -> bool {
        (0..3).all(|c| self.lower[c] <= hsv[c] && hsv[c] <= self.upper[c])
    }
}

pub fn rgb_to_hsv([r, g, b]: [u8; 3]) -> Hsv {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let s = if max > 0.0 { delta * 255.0 / max } else { 0.0 };
    let mut h = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }

    [
        (h / 2.0).round().min(180.0) as u8,
        s.round().min(255.0) as u8,
        max as u8,
    ]
}

pub fn luma([r, g, b]: [u8; 3]) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .min(255.0) as u8
}

/// Converts an (H, W, C) array on any consistent scale to 8-bit RGB.
///
/// Arrays whose maximum is at most 1.0 are treated as normalized and scaled
/// by 255. Values are clamped and truncated, and a single channel is
/// replicated to three.
pub fn to_rgb8(image: ArrayView3<f32>) -> Result<RgbImage, LayoutError> {
    let (height, width, channels) = image.dim();
    if height == 0 || width == 0 {
        return Err(LayoutError::Empty);
    }
    if channels != 1 && channels != 3 {
        return Err(LayoutError::UnsupportedChannels(channels));
    }

    let max = image
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::MIN, f32::max);
    let scale = if max <= 1.0 { 255.0 } else { 1.0 };
    let to_u8 = |v: f32| {
        if v.is_finite() {
            (v * scale).clamp(0.0, 255.0) as u8
        } else {
            0
        }
    };

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (row, col) = (y as usize, x as usize);
        if channels == 1 {
            let v = to_u8(image[[row, col, 0]]);
            image::Rgb([v, v, v])
        } else {
            image::Rgb([
                to_u8(image[[row, col, 0]]),
                to_u8(image[[row, col, 1]]),
                to_u8(image[[row, col, 2]]),
            ])
        }
    }))
}

pub fn to_gray(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        Luma([luma(rgb.get_pixel(x, y).0)])
    })
}

/// Fraction of pixels whose HSV value falls inside any of `ranges`.
pub fn hsv_mask_fraction(rgb: &RgbImage, ranges: &[HsvRange]) -> f32 {
    let total = rgb.width() as usize * rgb.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let hits = rgb
        .pixels()
        .filter(|p| {
            let hsv = rgb_to_hsv(p.0);
            ranges.iter().any(|range| range.contains(hsv))
        })
        .count();
    hits as f32 / total as f32
}

/// Population variance of the grayscale intensities.
pub fn gray_variance(gray: &GrayImage) -> f32 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let mean = gray.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = gray
        .as_raw()
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    var as f32
}
