//! Annotation overlay compositing for level-0 tiles.

use std::path::Path;

use image::{imageops, ImageResult, RgbaImage};

use crate::config::ViewerConfig;
use crate::core::ResampleFilter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
    pub white_cutoff: u8,
    pub highlight: [u8; 3],
    pub opacity: f32,
}

impl From<&ViewerConfig> for OverlayStyle {
    fn from(cfg: &ViewerConfig) -> Self {
        Self {
            white_cutoff: cfg.white_cutoff,
            highlight: cfg.highlight,
            opacity: cfg.overlay_opacity,
        }
    }
}

/// White pixels become fully transparent; everything else takes the highlight color.
pub fn key_overlay(overlay: &mut RgbaImage, style: &OverlayStyle) {
    let [hr, hg, hb] = style.highlight;
    for px in overlay.pixels_mut() {
        let [r, g, b, a] = px.0;
        if r >= style.white_cutoff && g >= style.white_cutoff && b >= style.white_cutoff {
            px.0 = [r, g, b, 0];
        } else if a > 0 {
            px.0 = [hr, hg, hb, a];
        }
    }
}

/// Source-over `overlay` onto `base` with an extra constant opacity.
pub fn blend(base: &RgbaImage, overlay: &RgbaImage, opacity: f32) -> RgbaImage {
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        let sa = src[3] as f32 / 255.0 * opacity;
        if sa <= 0.0 {
            continue;
        }
        let da = dst[3] as f32 / 255.0;
        let out_a = sa + da * (1.0 - sa);
        for c in 0..3 {
            let v = (src[c] as f32 * sa + dst[c] as f32 * da * (1.0 - sa)) / out_a;
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Scale, key and blend an overlay onto a base tile.
pub fn composite(base: &RgbaImage, overlay: RgbaImage, style: &OverlayStyle) -> RgbaImage {
    let mut overlay = if overlay.dimensions() != base.dimensions() {
        imageops::resize(
            &overlay,
            base.width(),
            base.height(),
            ResampleFilter::Bilinear.to_image_filter(),
        )
    } else {
        overlay
    };
    key_overlay(&mut overlay, style);
    blend(base, &overlay, style.opacity)
}

/// Decode the overlay tile at `path` and composite it. Errors leave the base untouched.
pub fn composite_from_file(
    base: &RgbaImage,
    path: &Path,
    style: &OverlayStyle,
) -> ImageResult<RgbaImage> {
    let overlay = image::open(path)?.to_rgba8();
    Ok(composite(base, overlay, style))
}
