use std::collections::BTreeMap;

use image::RgbaImage;

use crate::core::TileKey;

/// Axis-aligned rectangle in scene (level-pixel) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl SceneRect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn centered_at(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.w, self.h)
    }
}

/// A cache-resident tile: decoded, optionally composited, and placed in the scene.
#[derive(Debug, Clone)]
pub struct LoadedTile {
    pub key: TileKey,
    /// Top-left in scene coordinates.
    pub position: (f64, f64),
    pub pixmap: RgbaImage,
    pub annotated: bool,
}

/// The painting surface the tile cache drives. Tiles are lent, never handed over.
pub trait TileSurface {
    fn set_scene_rect(&mut self, rect: SceneRect);
    fn tile_added(&mut self, tile: &LoadedTile);
    fn tile_removed(&mut self, key: TileKey);
}

/// Headless surface.
#[derive(Debug, Default)]
pub struct NullSurface;

impl TileSurface for NullSurface {
    fn set_scene_rect(&mut self, _rect: SceneRect) {}
    fn tile_added(&mut self, _tile: &LoadedTile) {}
    fn tile_removed(&mut self, _key: TileKey) {}
}

/// Tracks what is on screen; handy for tooling and tests.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub scene_rect: Option<SceneRect>,
    pub placed: BTreeMap<TileKey, (f64, f64)>,
    pub added: usize,
    pub removed: usize,
}

impl TileSurface for RecordingSurface {
    fn set_scene_rect(&mut self, rect: SceneRect) {
        self.scene_rect = Some(rect);
    }

    fn tile_added(&mut self, tile: &LoadedTile) {
        self.added += 1;
        self.placed.insert(tile.key, tile.position);
    }

    fn tile_removed(&mut self, key: TileKey) {
        self.removed += 1;
        self.placed.remove(&key);
    }
}
