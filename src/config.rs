use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::builder::BuildOptions;

/// Level-of-detail and compositing knobs for the viewport tile cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Tile edge in level pixels.
    pub tile_edge: u32,
    /// Below this on-screen tile size (px) step to a coarser level.
    pub min_tile_screen: f64,
    /// Above this on-screen tile size (px) step to a finer level.
    pub max_tile_screen: f64,
    /// Zoom factor per wheel unit; 120 units ~ one notch.
    pub zoom_base: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Overlay pixels at or above this on every channel are transparent.
    pub white_cutoff: u8,
    pub overlay_opacity: f32,
    pub highlight: [u8; 3],
    /// Overlay directory = pyramid directory name + this suffix.
    pub overlay_suffix: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            tile_edge: 512,
            min_tile_screen: 128.0,
            max_tile_screen: 512.0,
            zoom_base: 1.0015,
            min_scale: 0.03,
            max_scale: 64.0,
            white_cutoff: 245,
            overlay_opacity: 0.40,
            highlight: [255, 0, 0],
            overlay_suffix: "_inference".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub build: BuildOptions,
    pub viewer: ViewerConfig,
}

impl Settings {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(settings)
    }

    /// Reject values that would break tiling or viewing arithmetic.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.build.tile_edge > 0, "build.tile_edge must be positive");
        ensure!(self.viewer.tile_edge > 0, "viewer.tile_edge must be positive");
        ensure!(
            self.viewer.min_scale > 0.0 && self.viewer.min_scale <= self.viewer.max_scale,
            "viewer.min_scale must be positive and at most viewer.max_scale"
        );
        Ok(())
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
