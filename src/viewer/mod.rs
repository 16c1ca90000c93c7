//! Level-of-detail tile cache for one open pyramid.
//!
//! Tiles live in scene coordinates of the current level (`col * edge`,
//! `row * edge`). The cache picks a level from the on-screen size of one tile,
//! keeps exactly the tiles under the visible rectangle resident, and
//! composites the level-0 annotation overlay when it exists and is enabled.
//! Everything runs synchronously on the caller's thread.

pub mod overlay;
pub mod surface;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::{imageops, Rgba, RgbaImage};
use tracing::{debug, info};

use crate::config::ViewerConfig;
use crate::core::pyramid::{copy_tile_into_mosaic, discover_levels, overlay_root, tile_file_name, PyramidInfo};
use crate::core::{ResampleFilter, TileKey};
use crate::error::PyramidError;
use overlay::{composite_from_file, OverlayStyle};
pub use surface::{LoadedTile, NullSurface, RecordingSurface, SceneRect, TileSurface};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub level: usize,
    /// Screen pixels per level pixel.
    pub scale: f64,
    /// Visible area in level-pixel coordinates.
    pub visible: SceneRect,
}

/// Half-open tile index range `[r0, r1) x [c0, c1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub r0: i64,
    pub r1: i64,
    pub c0: i64,
    pub c1: i64,
}

impl TileRange {
    /// Rows/cols spanned by `rect`: floor on the low edge, ceil on the high edge.
    pub fn covering(rect: &SceneRect, tile_edge: u32) -> Self {
        let edge = tile_edge as f64;
        Self {
            r0: (rect.y / edge).floor() as i64,
            r1: (rect.bottom() / edge).ceil() as i64,
            c0: (rect.x / edge).floor() as i64,
            c1: (rect.right() / edge).ceil() as i64,
        }
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        let (row, col) = (row as i64, col as i64);
        row >= self.r0 && row < self.r1 && col >= self.c0 && col < self.c1
    }

    /// Non-negative part of the range, further clipped to a `(cols, rows)` grid.
    fn clipped(&self, grid: (u64, u64)) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
        let clip = |lo: i64, hi: i64, max: u64| {
            let hi = hi.min(max as i64).max(0) as u32;
            let lo = (lo.max(0) as u32).min(hi);
            lo..hi
        };
        (clip(self.r0, self.r1, grid.1), clip(self.c0, self.c1, grid.0))
    }
}

/// Multiplicative zoom for a wheel delta, shrunk so the result stays in `[min_scale, max_scale]`.
pub fn zoom_factor(scale: f64, delta: f64, cfg: &ViewerConfig) -> f64 {
    let factor = cfg.zoom_base.powf(delta);
    let new_scale = scale * factor;
    if new_scale < cfg.min_scale {
        cfg.min_scale / scale
    } else if new_scale > cfg.max_scale {
        cfg.max_scale / scale
    } else {
        factor
    }
}

pub struct TileCache<S: TileSurface = NullSurface> {
    config: ViewerConfig,
    style: OverlayStyle,
    pyramid: PyramidInfo,
    overlay_root: Option<PathBuf>,
    annotations: bool,
    state: ViewportState,
    tiles: HashMap<TileKey, LoadedTile>,
    surface: S,
}

impl<S: TileSurface> TileCache<S> {
    /// Discover the pyramid under `tiles_root` and show its coarsest level fitted
    /// into a `viewport_px` (width, height) screen area.
    pub fn open(
        tiles_root: &Path,
        config: ViewerConfig,
        surface: S,
        viewport_px: (u32, u32),
    ) -> Result<Self, PyramidError> {
        let pyramid = discover_levels(tiles_root, config.tile_edge)?;
        let overlay = overlay_root(tiles_root, &config.overlay_suffix);
        let overlay_root = overlay.is_dir().then_some(overlay);
        let level = pyramid.level_count() - 1;
        info!(
            "pyramid opened root={} levels={} tiles={} overlay={}",
            tiles_root.display(),
            pyramid.level_count(),
            pyramid.tile_count(),
            overlay_root
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let mut cache = Self {
            style: OverlayStyle::from(&config),
            config,
            pyramid,
            overlay_root,
            annotations: true,
            state: ViewportState {
                level,
                scale: 1.0,
                visible: SceneRect::new(0.0, 0.0, viewport_px.0 as f64, viewport_px.1 as f64),
            },
            tiles: HashMap::new(),
            surface,
        };
        let rect = cache.scene_rect();
        cache.surface.set_scene_rect(rect);
        cache.fit_to_view();
        Ok(cache)
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn pyramid(&self) -> &PyramidInfo {
        &self.pyramid
    }

    pub fn state(&self) -> &ViewportState {
        &self.state
    }

    pub fn current_level(&self) -> usize {
        self.state.level
    }

    pub fn scale(&self) -> f64 {
        self.state.scale
    }

    pub fn annotations_enabled(&self) -> bool {
        self.annotations
    }

    pub fn has_overlay(&self) -> bool {
        self.overlay_root.is_some()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Full extent of a level in its own pixels.
    pub fn level_extent(&self, level: usize) -> (f64, f64) {
        let (w, h) = self.pyramid.levels[level].dimensions;
        (w as f64, h as f64)
    }

    pub fn scene_rect(&self) -> SceneRect {
        let (w, h) = self.level_extent(self.state.level);
        SceneRect::new(0.0, 0.0, w, h)
    }

    /// Screen size implied by the current scale and visible rectangle.
    pub fn viewport_px(&self) -> (f64, f64) {
        (
            self.state.visible.w * self.state.scale,
            self.state.visible.h * self.state.scale,
        )
    }

    pub fn tile(&self, key: &TileKey) -> Option<&LoadedTile> {
        self.tiles.get(key)
    }

    pub fn loaded_tiles(&self) -> impl Iterator<Item = &LoadedTile> {
        self.tiles.values()
    }

    pub fn loaded_keys(&self) -> Vec<TileKey> {
        let mut keys: Vec<TileKey> = self.tiles.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Apply a new scale and visible rectangle (scene coordinates), then
    /// re-evaluate the level and the resident tile set.
    pub fn set_viewport(&mut self, scale: f64, visible: SceneRect) {
        self.state.scale = scale;
        self.state.visible = visible;
        self.maybe_change_level();
        self.update_visible_tiles(false);
    }

    /// Fit the whole current level into the viewport.
    pub fn fit_to_view(&mut self) {
        let (ew, eh) = self.level_extent(self.state.level);
        let (vw, vh) = self.viewport_px();
        if ew <= 0.0 || eh <= 0.0 || vw <= 0.0 || vh <= 0.0 {
            return;
        }
        let scale = (vw / ew)
            .min(vh / eh)
            .clamp(self.config.min_scale, self.config.max_scale);
        self.state.scale = scale;
        self.state.visible = SceneRect::centered_at(ew / 2.0, eh / 2.0, vw / scale, vh / scale);
        self.update_visible_tiles(false);
    }

    /// Wheel/gesture zoom about the viewport center. Returns the factor applied.
    pub fn zoom(&mut self, delta: f64) -> f64 {
        if delta == 0.0 {
            return 1.0;
        }
        let factor = zoom_factor(self.state.scale, delta, &self.config);
        let new_scale = self.state.scale * factor;
        let (cx, cy) = self.state.visible.center();
        let (vw, vh) = self.viewport_px();
        let visible = SceneRect::centered_at(cx, cy, vw / new_scale, vh / new_scale);
        self.set_viewport(new_scale, visible);
        factor
    }

    /// Scroll by a screen-pixel offset.
    pub fn pan(&mut self, dx_px: f64, dy_px: f64) {
        let scale = self.state.scale;
        let visible = self.state.visible.translated(dx_px / scale, dy_px / scale);
        self.set_viewport(scale, visible);
    }

    /// The screen area changed size; the center and scale stay put.
    pub fn resize(&mut self, width_px: u32, height_px: u32) {
        let scale = self.state.scale;
        let (cx, cy) = self.state.visible.center();
        let visible =
            SceneRect::centered_at(cx, cy, width_px as f64 / scale, height_px as f64 / scale);
        self.set_viewport(scale, visible);
    }

    /// Step one level coarser or finer if a tile's on-screen size left the configured band.
    pub fn maybe_change_level(&mut self) -> bool {
        let tile_px = self.config.tile_edge as f64 * self.state.scale;
        let coarsest = self.pyramid.level_count() - 1;
        let mut level = self.state.level;
        if tile_px < self.config.min_tile_screen && level < coarsest {
            level += 1;
        } else if tile_px > self.config.max_tile_screen && level > 0 {
            level -= 1;
        }
        if level != self.state.level {
            self.swap_level(level);
            true
        } else {
            false
        }
    }

    /// Switch to `new_level`, keeping the viewport center at the same fraction of the extent.
    pub fn swap_level(&mut self, new_level: usize) {
        if new_level >= self.pyramid.level_count() {
            return;
        }
        let old_level = self.state.level;
        let (ow, oh) = self.level_extent(old_level);
        if ow <= 0.0 || oh <= 0.0 {
            return;
        }
        let (cx, cy) = self.state.visible.center();
        let fx = cx / ow;
        let fy = cy / oh;

        self.evict_all();
        self.state.level = new_level;
        let rect = self.scene_rect();
        self.surface.set_scene_rect(rect);

        let visible = self.state.visible;
        self.state.visible =
            SceneRect::centered_at(fx * rect.w, fy * rect.h, visible.w, visible.h);
        debug!(
            "level change from={} to={} fx={:.4} fy={:.4} scale={:.4}",
            old_level, new_level, fx, fy, self.state.scale
        );
    }

    pub fn visible_range(&self) -> TileRange {
        TileRange::covering(&self.state.visible, self.config.tile_edge)
    }

    /// Evict tiles outside the visible range (or on another level) and load the missing ones.
    /// With `reset`, every resident tile is rebuilt.
    pub fn update_visible_tiles(&mut self, reset: bool) {
        if reset {
            self.evict_all();
        }
        let level = self.state.level;
        let range = self.visible_range();

        let stale: Vec<TileKey> = self
            .tiles
            .keys()
            .filter(|k| k.level != level || !range.contains(k.row, k.col))
            .copied()
            .collect();
        for key in stale {
            self.evict(key);
        }

        let grid = self.pyramid.levels[level].grid(self.config.tile_edge);
        let (rows, cols) = range.clipped(grid);
        for row in rows {
            for col in cols.clone() {
                let key = TileKey::new(level, row, col);
                if self.tiles.contains_key(&key) {
                    continue;
                }
                if let Some(tile) = self.load_tile(key) {
                    self.surface.tile_added(&tile);
                    self.tiles.insert(key, tile);
                }
            }
        }
    }

    /// Flip overlay compositing and rebuild the visible tiles.
    pub fn toggle_annotations(&mut self) -> bool {
        self.annotations = !self.annotations;
        self.update_visible_tiles(true);
        self.annotations
    }

    /// Paint the resident tiles into a screen-sized image, the way the viewport shows them.
    /// Missing and background tiles stay white.
    pub fn render_visible(&self) -> RgbaImage {
        let (vw, vh) = self.viewport_px();
        let out_w = vw.round().max(1.0) as u32;
        let out_h = vh.round().max(1.0) as u32;
        let mut canvas = RgbaImage::from_pixel(out_w, out_h, Rgba([255, 255, 255, 255]));
        let scale = self.state.scale;
        let visible = self.state.visible;
        let filter = ResampleFilter::Bilinear.to_image_filter();

        for key in self.loaded_keys() {
            let Some(tile) = self.tiles.get(&key) else {
                continue;
            };
            let (tw, th) = tile.pixmap.dimensions();
            if tw == 0 || th == 0 {
                continue;
            }
            let sx0 = (tile.position.0 - visible.x) * scale;
            let sy0 = (tile.position.1 - visible.y) * scale;
            let sx1 = sx0 + tw as f64 * scale;
            let sy1 = sy0 + th as f64 * scale;

            // On-screen footprint clipped to the canvas, in whole pixels.
            let x0 = sx0.max(0.0).round();
            let y0 = sy0.max(0.0).round();
            let x1 = sx1.min(out_w as f64).round();
            let y1 = sy1.min(out_h as f64).round();
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            // Matching window of the tile, never empty.
            let cx0 = (((x0 - sx0) / scale).floor().max(0.0) as u32).min(tw - 1);
            let cy0 = (((y0 - sy0) / scale).floor().max(0.0) as u32).min(th - 1);
            let cx1 = (((x1 - sx0) / scale).ceil() as u32).clamp(cx0 + 1, tw);
            let cy1 = (((y1 - sy0) / scale).ceil() as u32).clamp(cy0 + 1, th);
            let window = imageops::crop_imm(&tile.pixmap, cx0, cy0, cx1 - cx0, cy1 - cy0).to_image();

            let (dw, dh) = ((x1 - x0) as u32, (y1 - y0) as u32);
            let painted = if window.dimensions() == (dw, dh) {
                window
            } else {
                imageops::resize(&window, dw, dh, filter)
            };
            copy_tile_into_mosaic(&painted, &mut canvas, x0 as i64, y0 as i64);
        }
        canvas
    }

    fn load_tile(&self, key: TileKey) -> Option<LoadedTile> {
        let level = &self.pyramid.levels[key.level];
        let path = level.path.join(tile_file_name(key.row, key.col));
        if !path.is_file() {
            return None;
        }
        let base = match image::open(&path) {
            Ok(img) => img.to_rgba8(),
            Err(err) => {
                debug!("tile decode failed key={} path={} err={}", key, path.display(), err);
                return None;
            }
        };

        let (pixmap, annotated) = match self.overlay_path(key) {
            Some(overlay) => match composite_from_file(&base, &overlay, &self.style) {
                Ok(composited) => (composited, true),
                Err(err) => {
                    debug!("overlay failed key={} path={} err={}", key, overlay.display(), err);
                    (base, false)
                }
            },
            None => (base, false),
        };

        Some(LoadedTile {
            key,
            position: key.origin(self.config.tile_edge),
            pixmap,
            annotated,
        })
    }

    fn overlay_path(&self, key: TileKey) -> Option<PathBuf> {
        // The overlay belongs to the level0 directory, not to the first discovered level.
        if self.pyramid.levels[key.level].index != 0 || !self.annotations {
            return None;
        }
        let path = self
            .overlay_root
            .as_ref()?
            .join(tile_file_name(key.row, key.col));
        path.is_file().then_some(path)
    }

    fn evict(&mut self, key: TileKey) {
        if self.tiles.remove(&key).is_some() {
            self.surface.tile_removed(key);
        }
    }

    fn evict_all(&mut self) {
        for key in self.loaded_keys() {
            self.evict(key);
        }
    }
}

impl<S: TileSurface> Drop for TileCache<S> {
    fn drop(&mut self) {
        self.evict_all();
    }
}
