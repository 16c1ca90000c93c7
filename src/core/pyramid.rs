use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use tracing::debug;

use crate::error::PyramidError;

/// Pyramid level metadata discovered from a `level<N>` directory.
#[derive(Clone, Debug)]
pub struct LevelInfo {
    /// Number parsed from the directory name.
    pub index: usize,
    pub path: PathBuf,
    /// Full extent in level pixels: `(max_col + 1, max_row + 1) * tile_edge`.
    pub dimensions: (u64, u64),
    /// Persisted tiles keyed by `(row, col)`. Absent keys are background.
    pub tiles: BTreeMap<(u32, u32), PathBuf>,
}

impl LevelInfo {
    pub fn tile_path(&self, row: u32, col: u32) -> Option<&Path> {
        self.tiles.get(&(row, col)).map(PathBuf::as_path)
    }

    /// Grid size as `(cols, rows)`.
    pub fn grid(&self, tile_edge: u32) -> (u64, u64) {
        let edge = tile_edge as u64;
        (self.dimensions.0 / edge, self.dimensions.1 / edge)
    }
}

/// A tile pyramid as found on disk, levels ordered finest to coarsest.
#[derive(Clone, Debug)]
pub struct PyramidInfo {
    pub root: PathBuf,
    pub tile_edge: u32,
    pub levels: Vec<LevelInfo>,
}

impl PyramidInfo {
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn tile_count(&self) -> usize {
        self.levels.iter().map(|l| l.tiles.len()).sum()
    }
}

pub fn level_dir_name(level: usize) -> String {
    format!("level{}", level)
}

pub fn tile_file_name(row: u32, col: u32) -> String {
    format!("tile_{}_{}.png", row, col)
}

pub fn tile_path(root: &Path, level: usize, row: u32, col: u32) -> PathBuf {
    root.join(level_dir_name(level)).join(tile_file_name(row, col))
}

/// Sibling directory holding the level-0 annotation overlay,
/// e.g. `slides/abc` + `_inference` -> `slides/abc_inference`.
pub fn overlay_root(tiles_root: &Path, suffix: &str) -> PathBuf {
    let stem = tiles_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = format!("{}{}", stem, suffix);
    match tiles_root.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Parse a level directory name like "level3" -> Some(3).
pub fn parse_level_dir(name: &str) -> Option<usize> {
    name.strip_prefix("level")?.parse().ok()
}

/// Parse tile coordinates from a filename like "tile_3_2.png" -> Some((3, 2)) as (row, col).
pub fn parse_tile_coords(name: &str) -> Option<(u32, u32)> {
    let trimmed = name.strip_prefix("tile_")?.strip_suffix(".png")?;
    let mut parts = trimmed.split('_');
    let row = parts.next()?.parse().ok()?;
    let col = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((row, col))
}

/// Discover the levels under `root` and infer each level's extent from its tile filenames.
pub fn discover_levels(root: &Path, tile_edge: u32) -> Result<PyramidInfo, PyramidError> {
    let entries = fs::read_dir(root).map_err(|source| PyramidError::Missing {
        path: root.to_path_buf(),
        source,
    })?;

    let mut level_dirs: Vec<(usize, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(level) = parse_level_dir(&name) {
            level_dirs.push((level, entry.path()));
        }
    }
    if level_dirs.is_empty() {
        return Err(PyramidError::NoLevels(root.to_path_buf()));
    }
    level_dirs.sort_by_key(|(level, _)| *level);

    let mut levels = Vec::with_capacity(level_dirs.len());
    for (index, path) in level_dirs {
        let level = scan_level(index, path, tile_edge)?;
        debug!(
            "level index={} dims={}x{} tiles={}",
            level.index,
            level.dimensions.0,
            level.dimensions.1,
            level.tiles.len()
        );
        levels.push(level);
    }

    Ok(PyramidInfo {
        root: root.to_path_buf(),
        tile_edge,
        levels,
    })
}

fn scan_level(index: usize, path: PathBuf, tile_edge: u32) -> Result<LevelInfo, PyramidError> {
    let entries = fs::read_dir(&path).map_err(|source| PyramidError::Missing {
        path: path.clone(),
        source,
    })?;
    let mut tiles = BTreeMap::new();
    let mut max_row = 0u32;
    let mut max_col = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((row, col)) = parse_tile_coords(&name) {
            max_row = max_row.max(row);
            max_col = max_col.max(col);
            tiles.insert((row, col), entry.path());
        }
    }
    if tiles.is_empty() {
        return Err(PyramidError::EmptyLevel(path));
    }
    let edge = tile_edge as u64;
    Ok(LevelInfo {
        index,
        path,
        dimensions: ((max_col as u64 + 1) * edge, (max_row as u64 + 1) * edge),
        tiles,
    })
}

/// Copy an RGBA tile into an RGBA mosaic with its top-left at pixel (x, y), clipping at the edges.
pub fn copy_tile_into_mosaic(tile: &RgbaImage, mosaic: &mut RgbaImage, x: i64, y: i64) {
    let (mw, mh) = (mosaic.width() as i64, mosaic.height() as i64);
    let tw = tile.width() as i64;
    let x_start = x.max(0);
    let x_end = (x + tw).min(mw);
    if x_start >= x_end {
        return;
    }
    let span = ((x_end - x_start) * 4) as usize;
    let tile_stride = (tile.width() * 4) as usize;
    let mosaic_stride = (mosaic.width() * 4) as usize;
    let src_raw = tile.as_raw();
    let dst_raw: &mut [u8] = mosaic;
    for ty in 0..tile.height() as i64 {
        let my = y + ty;
        if my < 0 || my >= mh {
            continue;
        }
        let tile_off = ty as usize * tile_stride + ((x_start - x) * 4) as usize;
        let mosaic_off = my as usize * mosaic_stride + (x_start * 4) as usize;
        dst_raw[mosaic_off..mosaic_off + span].copy_from_slice(&src_raw[tile_off..tile_off + span]);
    }
}
