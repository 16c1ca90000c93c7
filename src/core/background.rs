//! Blank-tile detection.
//!
//! A pixel is background only when every color channel is strictly above the
//! cutoff; alpha never takes part in the decision. The cutoff is given on the
//! 0-255 scale and rescaled for 16-bit and floating point rasters.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Per-channel cutoff on the 0-255 scale.
    pub channel_cutoff: u8,
    /// Minimum fraction of background pixels for a tile to count as blank.
    pub max_ratio: f64,
}

impl BackgroundConfig {
    /// Thresholds used when deciding whether to persist a pyramid tile.
    pub const BUILDER: BackgroundConfig = BackgroundConfig {
        channel_cutoff: 235,
        max_ratio: 0.97,
    };

    pub fn new(channel_cutoff: u8, max_ratio: f64) -> Self {
        Self {
            channel_cutoff,
            max_ratio,
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self::BUILDER
    }
}

/// True iff at least `cfg.max_ratio` of the pixels are background.
pub fn is_mostly_background(img: &DynamicImage, cfg: &BackgroundConfig) -> bool {
    match background_ratio(img, cfg.channel_cutoff) {
        Some(ratio) => ratio >= cfg.max_ratio,
        None => false,
    }
}

/// Fraction of background pixels, `None` for an empty raster.
pub fn background_ratio(img: &DynamicImage, channel_cutoff: u8) -> Option<f64> {
    let cutoff8 = channel_cutoff;
    let cutoff16 = channel_cutoff as u16 * 257;
    let cutoff_f = channel_cutoff as f32 / 255.0;
    match img {
        DynamicImage::ImageLuma8(buf) => ratio_over(buf.as_raw(), 1, 1, cutoff8),
        DynamicImage::ImageLumaA8(buf) => ratio_over(buf.as_raw(), 2, 1, cutoff8),
        DynamicImage::ImageRgb8(buf) => ratio_over(buf.as_raw(), 3, 3, cutoff8),
        DynamicImage::ImageRgba8(buf) => ratio_over(buf.as_raw(), 4, 3, cutoff8),
        DynamicImage::ImageLuma16(buf) => ratio_over(buf.as_raw(), 1, 1, cutoff16),
        DynamicImage::ImageLumaA16(buf) => ratio_over(buf.as_raw(), 2, 1, cutoff16),
        DynamicImage::ImageRgb16(buf) => ratio_over(buf.as_raw(), 3, 3, cutoff16),
        DynamicImage::ImageRgba16(buf) => ratio_over(buf.as_raw(), 4, 3, cutoff16),
        DynamicImage::ImageRgb32F(buf) => ratio_over(buf.as_raw(), 3, 3, cutoff_f),
        DynamicImage::ImageRgba32F(buf) => ratio_over(buf.as_raw(), 4, 3, cutoff_f),
        other => ratio_over(other.to_rgb8().as_raw(), 3, 3, cutoff8),
    }
}

/// Raw interleaved u8 variant for callers that hold plain pixel buffers.
pub fn is_mostly_background_raw(
    samples: &[u8],
    channels: usize,
    cfg: &BackgroundConfig,
) -> bool {
    let colors = if channels >= 3 { 3 } else { 1 };
    match ratio_over(samples, channels, colors, cfg.channel_cutoff) {
        Some(ratio) => ratio >= cfg.max_ratio,
        None => false,
    }
}

fn ratio_over<T: Copy + PartialOrd>(
    samples: &[T],
    channels: usize,
    colors: usize,
    cutoff: T,
) -> Option<f64> {
    let total = samples.len() / channels;
    if total == 0 {
        return None;
    }
    let background = samples
        .chunks_exact(channels)
        .filter(|px| px[..colors].iter().all(|&v| v > cutoff))
        .count();
    Some(background as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgb32FImage, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_all_max_is_background() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([255, 255, 255])));
        for cutoff in [0u8, 100, 235, 254] {
            for ratio in [0.0, 0.5, 0.97, 1.0] {
                assert!(is_mostly_background(&img, &BackgroundConfig::new(cutoff, ratio)));
            }
        }
    }

    #[test]
    fn test_nothing_above_cutoff() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([235, 250, 250])));
        // 235 is not strictly above 235
        assert!(!is_mostly_background(&img, &BackgroundConfig::BUILDER));
        assert!(!is_mostly_background(&img, &BackgroundConfig::new(235, 0.01)));
    }

    #[test]
    fn test_every_channel_must_pass() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 10])));
        assert!(!is_mostly_background(&img, &BackgroundConfig::new(200, 0.5)));
    }

    #[test]
    fn test_alpha_ignored() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([250, 250, 250, 0])));
        assert!(is_mostly_background(&img, &BackgroundConfig::BUILDER));
        let clear = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0])));
        assert!(!is_mostly_background(&clear, &BackgroundConfig::BUILDER));
    }

    #[test]
    fn test_ratio_threshold() {
        // 10x10 with 97 white pixels and 3 dark ones
        let mut img = GrayImage::from_pixel(10, 10, Luma([255]));
        for x in 0..3 {
            img.put_pixel(x, 0, Luma([0]));
        }
        let img = DynamicImage::ImageLuma8(img);
        assert_eq!(background_ratio(&img, 235), Some(0.97));
        assert!(is_mostly_background(&img, &BackgroundConfig::new(235, 0.97)));
        assert!(!is_mostly_background(&img, &BackgroundConfig::new(235, 0.98)));
    }

    #[test]
    fn test_float_cutoff_normalized() {
        let bright: Rgb32FImage = ImageBuffer::from_pixel(4, 4, Rgb([0.95f32, 0.95, 0.95]));
        let dim: Rgb32FImage = ImageBuffer::from_pixel(4, 4, Rgb([0.9f32, 0.9, 0.9]));
        let cfg = BackgroundConfig::BUILDER; // 235/255 ~= 0.9216
        assert!(is_mostly_background(&DynamicImage::ImageRgb32F(bright), &cfg));
        assert!(!is_mostly_background(&DynamicImage::ImageRgb32F(dim), &cfg));
    }

    #[test]
    fn test_sixteen_bit_cutoff_normalized() {
        let img: ImageBuffer<Rgb<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(2, 2, Rgb([240 * 257, 240 * 257, 240 * 257]));
        assert!(is_mostly_background(&DynamicImage::ImageRgb16(img), &BackgroundConfig::BUILDER));
    }

    #[test]
    fn test_empty_raster() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(!is_mostly_background(&img, &BackgroundConfig::new(0, 0.0)));
    }

    #[test]
    fn test_raw_variant() {
        let rgba = [255u8, 255, 255, 0].repeat(9);
        assert!(is_mostly_background_raw(&rgba, 4, &BackgroundConfig::BUILDER));
        let gray = vec![12u8; 9];
        assert!(!is_mostly_background_raw(&gray, 1, &BackgroundConfig::BUILDER));
    }

    #[test]
    fn test_deterministic() {
        let mut img = RgbImage::from_pixel(32, 32, Rgb([250, 250, 250]));
        for i in 0..32 {
            img.put_pixel(i, i, Rgb([20, 20, 20]));
        }
        let img = DynamicImage::ImageRgb8(img);
        let a = background_ratio(&img, 235);
        let b = background_ratio(&img, 235);
        assert_eq!(a, b);
    }
}
