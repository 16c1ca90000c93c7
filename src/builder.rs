use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use image::{ImageError, ImageFormat, RgbImage, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::background::{is_mostly_background_raw, BackgroundConfig};
use crate::core::pyramid::{level_dir_name, tile_file_name};
use crate::core::{fir_resize_rgb, ResampleFilter};
use crate::error::BuildError;
use crate::progress::ProgressReporter;
use crate::source::{open_source, SlideSource, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Edge of every persisted tile, in pixels.
    pub tile_edge: u32,
    pub background: BackgroundConfig,
    /// Filter for the level-0 2x downscale.
    pub filter: ResampleFilter,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tile_edge: 512,
            background: BackgroundConfig::default(),
            filter: ResampleFilter::Lanczos3,
        }
    }
}

/// Tiling grid for one source level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelPlan {
    pub level: usize,
    /// Distance between region origins, in level pixels.
    pub stride: u32,
    /// Edge of the region requested from the source, in level pixels.
    pub request: u32,
    pub cols: u32,
    pub rows: u32,
    pub downsample: f64,
}

impl LevelPlan {
    pub fn total(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Region origin for a grid cell, converted to level-0 coordinates (truncated).
    pub fn region_origin(&self, row: u32, col: u32) -> (u64, u64) {
        let x_lv = col as u64 * self.stride as u64;
        let y_lv = row as u64 * self.stride as u64;
        (
            (x_lv as f64 * self.downsample) as u64,
            (y_lv as f64 * self.downsample) as u64,
        )
    }

    pub fn cells(&self) -> Vec<(u32, u32)> {
        let mut cells = Vec::with_capacity(self.total());
        for row in 0..self.rows {
            for col in 0..self.cols {
                cells.push((row, col));
            }
        }
        cells
    }
}

/// Level 0 is read at twice the tile edge and downscaled; every other level is read 1:1.
pub fn plan_level(source: &dyn SlideSource, level: usize, tile_edge: u32) -> LevelPlan {
    let stride = if level == 0 { tile_edge * 2 } else { tile_edge };
    let (w, h) = source.level_dimensions(level);
    LevelPlan {
        level,
        stride,
        request: stride,
        cols: w.div_ceil(stride as u64) as u32,
        rows: h.div_ceil(stride as u64) as u32,
        downsample: source.level_downsample(level),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelSummary {
    pub level: usize,
    pub cols: u32,
    pub rows: u32,
    pub written: usize,
    /// Cells classified as background and left without a file.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    pub out_dir: PathBuf,
    pub tile_edge: u32,
    pub levels: Vec<LevelSummary>,
    pub elapsed_ms: u128,
}

impl BuildSummary {
    pub fn written(&self) -> usize {
        self.levels.iter().map(|l| l.written).sum()
    }

    pub fn skipped(&self) -> usize {
        self.levels.iter().map(|l| l.skipped).sum()
    }
}

/// Open `slide` and tile it into `out_dir`.
pub fn build_pyramid_from_path(
    slide: &Path,
    kind: SourceKind,
    out_dir: &Path,
    opts: &BuildOptions,
    progress: &ProgressReporter,
) -> Result<BuildSummary, BuildError> {
    info!("Opening slide: {}", slide.display());
    let source = open_source(slide, kind, opts.tile_edge)?;
    build_pyramid(source.as_ref(), out_dir, opts, progress)
}

/// Tile every level of `source` into `out_dir/level<L>/tile_<row>_<col>.png`.
///
/// Background cells are skipped without writing a file. Any read, encode or
/// write failure aborts the whole build; files already written are left in place.
pub fn build_pyramid(
    source: &dyn SlideSource,
    out_dir: &Path,
    opts: &BuildOptions,
    progress: &ProgressReporter,
) -> Result<BuildSummary, BuildError> {
    let start = Instant::now();
    create_dir(out_dir)?;
    let level_count = source.level_count();
    info!(
        "Building pyramid out={} levels={} tile_edge={} filter={}",
        out_dir.display(),
        level_count,
        opts.tile_edge,
        opts.filter
    );

    let mut levels = Vec::with_capacity(level_count);
    for level in 0..level_count {
        let plan = plan_level(source, level, opts.tile_edge);
        levels.push(build_level(source, &plan, out_dir, opts, progress)?);
    }

    let summary = BuildSummary {
        out_dir: out_dir.to_path_buf(),
        tile_edge: opts.tile_edge,
        levels,
        elapsed_ms: start.elapsed().as_millis(),
    };
    info!(
        "Pyramid complete: written={} skipped={} ms={}",
        summary.written(),
        summary.skipped(),
        summary.elapsed_ms
    );
    Ok(summary)
}

enum CellOutcome {
    Written,
    Skipped,
}

fn build_level(
    source: &dyn SlideSource,
    plan: &LevelPlan,
    out_dir: &Path,
    opts: &BuildOptions,
    progress: &ProgressReporter,
) -> Result<LevelSummary, BuildError> {
    let phase = format!("Tiling level {}", plan.level);
    progress.set(phase.clone(), 0);

    let level_dir = out_dir.join(level_dir_name(plan.level));
    create_dir(&level_dir)?;

    let total = plan.total();
    info!(
        "  Level {}: {}x{} grid stride={} downsample={:.3}",
        plan.level, plan.cols, plan.rows, plan.stride, plan.downsample
    );

    // Counted and reported under one lock so snapshots never go backwards.
    let processed = Mutex::new(0usize);
    let written = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let first_error: Mutex<Option<BuildError>> = Mutex::new(None);

    plan.cells().par_iter().for_each(|&(row, col)| {
        if first_error.lock().map(|e| e.is_some()).unwrap_or(true) {
            return;
        }
        match process_cell(source, plan, row, col, &level_dir, opts) {
            Ok(CellOutcome::Written) => {
                written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(CellOutcome::Skipped) => {
                skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if let Ok(mut slot) = first_error.lock() {
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
                return;
            }
        }
        if let Ok(mut done) = processed.lock() {
            *done += 1;
            progress.step(&phase, *done, total);
        }
    });

    if let Some(err) = first_error.into_inner().ok().flatten() {
        return Err(err);
    }

    // Pin the final state of the phase, also for an empty grid.
    progress.step(&phase, total, total);

    let summary = LevelSummary {
        level: plan.level,
        cols: plan.cols,
        rows: plan.rows,
        written: written.into_inner(),
        skipped: skipped.into_inner(),
    };
    info!(
        "  Level {} done: written={} skipped={}",
        summary.level, summary.written, summary.skipped
    );
    Ok(summary)
}

fn process_cell(
    source: &dyn SlideSource,
    plan: &LevelPlan,
    row: u32,
    col: u32,
    level_dir: &Path,
    opts: &BuildOptions,
) -> Result<CellOutcome, BuildError> {
    let (x0, y0) = plan.region_origin(row, col);
    let region = source.read_region(x0, y0, plan.level, plan.request, plan.request)?;

    if is_mostly_background_raw(region.as_raw(), 4, &opts.background) {
        debug!("skip background level={} row={} col={}", plan.level, row, col);
        return Ok(CellOutcome::Skipped);
    }

    let mut tile = flatten_on_white(&region);
    if plan.level == 0 && plan.request != opts.tile_edge {
        tile = downscale(tile, opts.tile_edge, opts.filter)
            .map_err(|reason| BuildError::Resize { row, col, reason })?;
    }

    let path = level_dir.join(tile_file_name(row, col));
    save_png(&tile, &path)?;
    Ok(CellOutcome::Written)
}

/// Alpha-composite over an opaque white canvas.
pub fn flatten_on_white(region: &RgbaImage) -> RgbImage {
    let mut out = RgbImage::new(region.width(), region.height());
    for (dst, src) in out.pixels_mut().zip(region.pixels()) {
        let a = src[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        dst.0 = [blend(src[0]), blend(src[1]), blend(src[2])];
    }
    out
}

fn downscale(tile: RgbImage, edge: u32, filter: ResampleFilter) -> Result<RgbImage, String> {
    let (w, h) = tile.dimensions();
    let resized = fir_resize_rgb(tile.into_raw(), w, h, edge, edge, filter)?;
    RgbImage::from_raw(edge, edge, resized).ok_or_else(|| "resized buffer size mismatch".to_string())
}

fn save_png(tile: &RgbImage, path: &Path) -> Result<(), BuildError> {
    tile.save_with_format(path, ImageFormat::Png)
        .map_err(|err| match err {
            ImageError::IoError(source) => BuildError::OutputUnwritable {
                path: path.to_path_buf(),
                source,
            },
            other => BuildError::TileEncode {
                path: path.to_path_buf(),
                source: other,
            },
        })
}

fn create_dir(dir: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(dir).map_err(|source| BuildError::OutputUnwritable {
        path: dir.to_path_buf(),
        source,
    })
}
