// End-to-end: slide -> pyramid on disk -> discovery -> viewport cache

use std::sync::Mutex;

use anyhow::Result;
use image::{Rgba, RgbaImage};
use slide_tiler::builder::{build_pyramid, plan_level, BuildOptions};
use slide_tiler::core::pyramid::discover_levels;
use slide_tiler::error::BuildError;
use slide_tiler::progress::ProgressReporter;
use slide_tiler::source::{ImageSource, SlideSource};
use slide_tiler::viewer::{NullSurface, TileCache};
use slide_tiler::ViewerConfig;

/// Wraps a source and records every region request.
struct RecordingSource {
    inner: ImageSource,
    requests: Mutex<Vec<(usize, u64, u64, u32, u32)>>,
}

impl RecordingSource {
    fn new(inner: ImageSource) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<(usize, u64, u64, u32, u32)> {
        let mut r = self.requests.lock().unwrap().clone();
        r.sort();
        r
    }
}

impl SlideSource for RecordingSource {
    fn level_count(&self) -> usize {
        self.inner.level_count()
    }

    fn level_dimensions(&self, level: usize) -> (u64, u64) {
        self.inner.level_dimensions(level)
    }

    fn level_downsample(&self, level: usize) -> f64 {
        self.inner.level_downsample(level)
    }

    fn read_region(&self, x0: u64, y0: u64, level: usize, w: u32, h: u32) -> Result<RgbaImage, BuildError> {
        self.requests.lock().unwrap().push((level, x0, y0, w, h));
        self.inner.read_region(x0, y0, level, w, h)
    }
}

fn tissue(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x % 200) as u8, (y % 200) as u8, 120, 255]))
}

#[test]
fn test_two_level_request_plan() -> Result<()> {
    let source = RecordingSource::new(ImageSource::from_levels(
        vec![tissue(1024, 1024), tissue(512, 512)],
        vec![1.0, 2.0],
    ));
    let dir = tempfile::tempdir()?;
    let summary = build_pyramid(&source, dir.path(), &BuildOptions::default(), &ProgressReporter::new())?;

    assert_eq!(
        source.requests(),
        vec![(0, 0, 0, 1024, 1024), (1, 0, 0, 512, 512)]
    );
    assert_eq!(summary.levels[0].written, 1);
    assert_eq!(summary.levels[1].written, 1);

    let l0 = image::open(dir.path().join("level0/tile_0_0.png"))?;
    assert_eq!((l0.width(), l0.height()), (512, 512));
    let l1 = image::open(dir.path().join("level1/tile_0_0.png"))?;
    assert_eq!((l1.width(), l1.height()), (512, 512));
    Ok(())
}

#[test]
fn test_level0_stride_is_twice_the_edge() -> Result<()> {
    let source = RecordingSource::new(ImageSource::from_levels(
        vec![tissue(2048, 2048), tissue(1024, 1024)],
        vec![1.0, 2.0],
    ));
    let plan = plan_level(&source, 0, 512);
    assert_eq!((plan.cols, plan.rows, plan.stride), (2, 2, 1024));

    let dir = tempfile::tempdir()?;
    build_pyramid(&source, dir.path(), &BuildOptions::default(), &ProgressReporter::new())?;
    let level0: Vec<_> = source.requests().into_iter().filter(|r| r.0 == 0).collect();
    assert_eq!(
        level0,
        vec![
            (0, 0, 0, 1024, 1024),
            (0, 0, 1024, 1024, 1024),
            (0, 1024, 0, 1024, 1024),
            (0, 1024, 1024, 1024, 1024),
        ]
    );
    // Level 1 regions are placed in level-0 coordinates through the downsample.
    let level1: Vec<_> = source.requests().into_iter().filter(|r| r.0 == 1).collect();
    assert_eq!(
        level1,
        vec![
            (1, 0, 0, 512, 512),
            (1, 0, 1024, 512, 512),
            (1, 1024, 0, 512, 512),
            (1, 1024, 1024, 512, 512),
        ]
    );
    Ok(())
}

#[test]
fn test_written_tiles_are_discoverable() -> Result<()> {
    // White slide with two tissue islands.
    let mut base = RgbaImage::from_pixel(256, 192, Rgba([255, 255, 255, 255]));
    for y in 0..40 {
        for x in 0..40 {
            base.put_pixel(10 + x, 10 + y, Rgba([90, 40, 120, 255]));
            base.put_pixel(200 + x, 140 + y, Rgba([90, 40, 120, 255]));
        }
    }
    let source = ImageSource::from_image(base, 32);
    let opts = BuildOptions {
        tile_edge: 32,
        ..BuildOptions::default()
    };
    let dir = tempfile::tempdir()?;
    let summary = build_pyramid(&source, dir.path(), &opts, &ProgressReporter::new())?;
    assert!(summary.skipped() > 0);

    let info = discover_levels(dir.path(), 32)?;
    assert_eq!(info.level_count(), source.level_count());
    assert_eq!(info.tile_count(), summary.written());
    for level in &info.levels {
        for ((row, col), path) in &level.tiles {
            assert_eq!(
                path,
                &dir.path()
                    .join(format!("level{}", level.index))
                    .join(format!("tile_{}_{}.png", row, col))
            );
            let tile = image::open(path)?;
            assert_eq!((tile.width(), tile.height()), (32, 32));
        }
    }

    // Rerunning over the same tree rewrites the same files.
    build_pyramid(&source, dir.path(), &opts, &ProgressReporter::new())?;
    let again = discover_levels(dir.path(), 32)?;
    for (a, b) in info.levels.iter().zip(again.levels.iter()) {
        assert_eq!(a.dimensions, b.dimensions);
        assert_eq!(a.tiles.len(), b.tiles.len());
    }
    Ok(())
}

#[test]
fn test_built_pyramid_opens_in_viewer() -> Result<()> {
    let source = ImageSource::from_image(tissue(512, 512), 64);
    let opts = BuildOptions {
        tile_edge: 64,
        ..BuildOptions::default()
    };
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("slide");
    build_pyramid(&source, &root, &opts, &ProgressReporter::new())?;

    let config = ViewerConfig {
        tile_edge: 64,
        min_tile_screen: 16.0,
        max_tile_screen: 64.0,
        ..ViewerConfig::default()
    };
    let cache = TileCache::open(&root, config, NullSurface, (256, 256))?;
    let coarsest = cache.pyramid().level_count() - 1;
    assert_eq!(cache.current_level(), coarsest);
    assert!(!cache.has_overlay());
    assert!(!cache.loaded_keys().is_empty());
    assert!(cache.loaded_keys().iter().all(|k| k.level == coarsest));
    Ok(())
}
