//! Slide readers feeding the pyramid builder.
//!
//! Region origins are always given in level-0 coordinates, region sizes in
//! pixels of the level being read. Pixels outside the level extent come back
//! fully transparent (`[0, 0, 0, 0]`).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{imageops, RgbaImage};
use tracing::info;

use crate::core::ResampleFilter;
use crate::error::BuildError;

pub trait SlideSource: Send + Sync {
    fn level_count(&self) -> usize;

    /// Native size of `level` in that level's pixels.
    fn level_dimensions(&self, level: usize) -> (u64, u64);

    /// Ratio of the level-0 grid to this level's grid (1.0 at level 0).
    fn level_downsample(&self, level: usize) -> f64;

    fn read_region(
        &self,
        x0: u64,
        y0: u64,
        level: usize,
        w: u32,
        h: u32,
    ) -> Result<RgbaImage, BuildError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// OpenSlide when compiled in and the file is not a plain raster.
    Auto,
    OpenSlide,
    Image,
}

impl FromStr for SourceKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SourceKind::Auto),
            "openslide" => Ok(SourceKind::OpenSlide),
            "image" => Ok(SourceKind::Image),
            _ => Err(format!("unknown source kind '{}'. Available: auto, openslide, image", s)),
        }
    }
}

/// Open `path` as a slide. Fails before anything is written if the file is unusable.
pub fn open_source(
    path: &Path,
    kind: SourceKind,
    tile_edge: u32,
) -> Result<Box<dyn SlideSource>, BuildError> {
    match kind {
        SourceKind::Image => Ok(Box::new(ImageSource::open(path, tile_edge)?)),
        SourceKind::OpenSlide => open_openslide(path),
        SourceKind::Auto => {
            if is_plain_raster(path) || !cfg!(feature = "openslide") {
                Ok(Box::new(ImageSource::open(path, tile_edge)?))
            } else {
                open_openslide(path)
            }
        }
    }
}

fn is_plain_raster(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

#[cfg(feature = "openslide")]
fn open_openslide(path: &Path) -> Result<Box<dyn SlideSource>, BuildError> {
    Ok(Box::new(openslide_source::OpenSlideSource::open(path)?))
}

#[cfg(not(feature = "openslide"))]
fn open_openslide(path: &Path) -> Result<Box<dyn SlideSource>, BuildError> {
    Err(BuildError::SourceUnreadable {
        path: path.to_path_buf(),
        reason: "built without the `openslide` feature".to_string(),
    })
}

/// A plain raster exposed as a multi-level slide by repeated 2x halving.
pub struct ImageSource {
    levels: Vec<RgbaImage>,
    downsamples: Vec<f64>,
}

impl ImageSource {
    pub fn open(path: &Path, tile_edge: u32) -> Result<Self, BuildError> {
        let img = image::open(path).map_err(|e| BuildError::SourceUnreadable {
            path: PathBuf::from(path),
            reason: e.to_string(),
        })?;
        let source = Self::from_image(img.to_rgba8(), tile_edge);
        info!(
            "image source path={} dims={}x{} levels={}",
            path.display(),
            img.width(),
            img.height(),
            source.levels.len()
        );
        Ok(source)
    }

    /// Halve until the longest edge fits in one tile.
    pub fn from_image(base: RgbaImage, tile_edge: u32) -> Self {
        let mut levels = vec![base];
        let mut downsamples = vec![1.0];
        loop {
            let last = &levels[levels.len() - 1];
            let (w, h) = last.dimensions();
            if w.max(h) <= tile_edge || w <= 1 || h <= 1 {
                break;
            }
            let next = imageops::resize(
                last,
                (w + 1) / 2,
                (h + 1) / 2,
                ResampleFilter::Bilinear.to_image_filter(),
            );
            downsamples.push(downsamples[downsamples.len() - 1] * 2.0);
            levels.push(next);
        }
        Self { levels, downsamples }
    }

    /// Explicit levels, finest first. `downsamples[0]` should be 1.0.
    pub fn from_levels(levels: Vec<RgbaImage>, downsamples: Vec<f64>) -> Self {
        assert_eq!(levels.len(), downsamples.len(), "one downsample per level");
        Self { levels, downsamples }
    }
}

impl SlideSource for ImageSource {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_dimensions(&self, level: usize) -> (u64, u64) {
        let (w, h) = self.levels[level].dimensions();
        (w as u64, h as u64)
    }

    fn level_downsample(&self, level: usize) -> f64 {
        self.downsamples[level]
    }

    fn read_region(
        &self,
        x0: u64,
        y0: u64,
        level: usize,
        w: u32,
        h: u32,
    ) -> Result<RgbaImage, BuildError> {
        let src = self.levels.get(level).ok_or_else(|| BuildError::RegionUnreadable {
            level,
            x: x0,
            y: y0,
            reason: "no such level".to_string(),
        })?;
        let ds = self.downsamples[level];
        // Nearest level pixel; callers truncate when scaling up by a fractional downsample.
        let lx = (x0 as f64 / ds).round() as u64;
        let ly = (y0 as f64 / ds).round() as u64;
        Ok(extract_region(src, lx, ly, w, h))
    }
}

/// Copy a w x h window at (x, y) out of `src`; pixels past the edge stay transparent.
fn extract_region(src: &RgbaImage, x: u64, y: u64, w: u32, h: u32) -> RgbaImage {
    let mut out = RgbaImage::new(w, h);
    let (sw, sh) = (src.width() as u64, src.height() as u64);
    if x >= sw || y >= sh {
        return out;
    }
    let copy_w = (sw - x).min(w as u64) as usize;
    let copy_h = (sh - y).min(h as u64) as usize;
    let src_stride = sw as usize * 4;
    let dst_stride = w as usize * 4;
    let src_raw = src.as_raw();
    let dst_raw: &mut [u8] = &mut out;
    for row in 0..copy_h {
        let s = (y as usize + row) * src_stride + x as usize * 4;
        let d = row * dst_stride;
        dst_raw[d..d + copy_w * 4].copy_from_slice(&src_raw[s..s + copy_w * 4]);
    }
    out
}

#[cfg(feature = "openslide")]
mod openslide_source {
    use std::path::Path;
    use std::sync::Mutex;

    use image::RgbaImage;
    use openslide_rs::{Address, OpenSlide, Region, Size};
    use tracing::info;

    use super::SlideSource;
    use crate::error::BuildError;

    /// Whole-slide formats (.svs, .ndpi, .mrxs, ...) read through libopenslide.
    pub struct OpenSlideSource {
        slide: Mutex<OpenSlide>,
        dimensions: Vec<(u64, u64)>,
        downsamples: Vec<f64>,
    }

    impl OpenSlideSource {
        pub fn open(path: &Path) -> Result<Self, BuildError> {
            let unreadable = |reason: String| BuildError::SourceUnreadable {
                path: path.to_path_buf(),
                reason,
            };
            let slide = OpenSlide::new(path).map_err(|e| unreadable(format!("{:?}", e)))?;
            let level_count = slide
                .get_level_count()
                .map_err(|e| unreadable(format!("level count: {:?}", e)))?;
            let mut dimensions = Vec::with_capacity(level_count as usize);
            let mut downsamples = Vec::with_capacity(level_count as usize);
            for level in 0..level_count {
                let dims = slide
                    .get_level_dimensions(level)
                    .map_err(|e| unreadable(format!("level {} dimensions: {:?}", level, e)))?;
                let ds = slide
                    .get_level_downsample(level)
                    .map_err(|e| unreadable(format!("level {} downsample: {:?}", level, e)))?;
                dimensions.push((dims.w as u64, dims.h as u64));
                downsamples.push(ds);
            }
            info!(
                "openslide source path={} levels={} l0={}x{}",
                path.display(),
                level_count,
                dimensions.first().map(|d| d.0).unwrap_or(0),
                dimensions.first().map(|d| d.1).unwrap_or(0)
            );
            Ok(Self {
                slide: Mutex::new(slide),
                dimensions,
                downsamples,
            })
        }
    }

    impl SlideSource for OpenSlideSource {
        fn level_count(&self) -> usize {
            self.dimensions.len()
        }

        fn level_dimensions(&self, level: usize) -> (u64, u64) {
            self.dimensions[level]
        }

        fn level_downsample(&self, level: usize) -> f64 {
            self.downsamples[level]
        }

        fn read_region(
            &self,
            x0: u64,
            y0: u64,
            level: usize,
            w: u32,
            h: u32,
        ) -> Result<RgbaImage, BuildError> {
            let region = Region {
                address: Address {
                    x: x0 as u32,
                    y: y0 as u32,
                },
                level: level as u32,
                size: Size { w, h },
            };
            let bgra = self
                .slide
                .lock()
                .map_err(|_| BuildError::RegionUnreadable {
                    level,
                    x: x0,
                    y: y0,
                    reason: "slide handle poisoned".to_string(),
                })?
                .read_region(&region)
                .map_err(|e| BuildError::RegionUnreadable {
                    level,
                    x: x0,
                    y: y0,
                    reason: format!("{:?}", e),
                })?;
            Ok(unpremultiply_bgra(&bgra, w, h))
        }
    }

    /// Pre-multiplied BGRA -> straight RGBA. Fully transparent pixels stay [0, 0, 0, 0].
    fn unpremultiply_bgra(bgra: &[u8], w: u32, h: u32) -> RgbaImage {
        let mut out = RgbaImage::new(w, h);
        for (dst, src) in out.pixels_mut().zip(bgra.chunks_exact(4)) {
            let a = src[3];
            if a == 0 {
                continue;
            }
            if a == 255 {
                dst.0 = [src[2], src[1], src[0], 255];
            } else {
                let af = a as f32;
                let un = |v: u8| (v as f32 * 255.0 / af).round().min(255.0) as u8;
                dst.0 = [un(src[2]), un(src[1]), un(src[0]), a];
            }
        }
        out
    }
}
