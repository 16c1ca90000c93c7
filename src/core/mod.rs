pub mod background;
pub mod pyramid;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Resampling filter for the level-0 oversample-then-downscale step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleFilter {
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl ResampleFilter {
    /// Convert to the corresponding `image` crate filter type.
    pub fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            ResampleFilter::Bilinear => image::imageops::FilterType::Triangle,
            ResampleFilter::Bicubic => image::imageops::FilterType::CatmullRom,
            ResampleFilter::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }

    fn to_fir_alg(self) -> fast_image_resize::ResizeAlg {
        use fast_image_resize as fir;
        match self {
            ResampleFilter::Bilinear => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
            ResampleFilter::Bicubic => fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom),
            ResampleFilter::Lanczos3 => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
        }
    }
}

impl Default for ResampleFilter {
    fn default() -> Self {
        ResampleFilter::Lanczos3
    }
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleFilter::Bilinear => write!(f, "bilinear"),
            ResampleFilter::Bicubic => write!(f, "bicubic"),
            ResampleFilter::Lanczos3 => write!(f, "lanczos3"),
        }
    }
}

impl FromStr for ResampleFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bilinear" | "triangle" => Ok(ResampleFilter::Bilinear),
            "bicubic" | "catmullrom" | "catmull-rom" => Ok(ResampleFilter::Bicubic),
            "lanczos3" | "lanczos" => Ok(ResampleFilter::Lanczos3),
            _ => Err(format!("unknown resample filter '{}'. Available: bilinear, bicubic, lanczos3", s)),
        }
    }
}

/// Address of one tile in the pyramid.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileKey {
    pub level: usize,
    pub row: u32,
    pub col: u32,
}

impl TileKey {
    pub fn new(level: usize, row: u32, col: u32) -> Self {
        Self { level, row, col }
    }

    /// Top-left corner of this tile in level-pixel coordinates.
    pub fn origin(&self, tile_edge: u32) -> (f64, f64) {
        (
            self.col as f64 * tile_edge as f64,
            self.row as f64 * tile_edge as f64,
        )
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.level, self.row, self.col)
    }
}

// ---------------------------------------------------------------------------
// SIMD-accelerated resize (via fast_image_resize)
// ---------------------------------------------------------------------------

/// Resize an interleaved RGB buffer using SIMD-accelerated fast_image_resize.
pub fn fir_resize_rgb(
    rgb: Vec<u8>,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    filter: ResampleFilter,
) -> Result<Vec<u8>, String> {
    use fast_image_resize as fir;
    let src = fir::images::Image::from_vec_u8(src_w, src_h, rgb, fir::pixels::PixelType::U8x3)
        .map_err(|e| format!("fir source image: {}", e))?;
    let mut dst = fir::images::Image::new(dst_w, dst_h, fir::pixels::PixelType::U8x3);
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src, &mut dst, &fir::ResizeOptions::new().resize_alg(filter.to_fir_alg()))
        .map_err(|e| format!("fir resize: {}", e))?;
    Ok(dst.into_vec())
}
