use std::path::PathBuf;

use thiserror::Error;

/// Fatal failures while producing a pyramid. Every variant aborts the build.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot open slide {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("read_region level={level} x={x} y={y} failed: {reason}")]
    RegionUnreadable {
        level: usize,
        x: u64,
        y: u64,
        reason: String,
    },

    #[error("cannot write {path}: {source}")]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode tile {path}: {source}")]
    TileEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("resize failed for tile row={row} col={col}: {reason}")]
    Resize { row: u32, col: u32, reason: String },

    #[error("annotation stage failed: {0}")]
    Annotation(String),

    #[error("build worker failed: {0}")]
    Worker(String),
}

/// Raised when a tile directory tree cannot back a viewer.
#[derive(Error, Debug)]
pub enum PyramidError {
    #[error("pyramid root not readable: {path}: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no level* directories in {0}")]
    NoLevels(PathBuf),

    #[error("level directory {0} contains no tiles")]
    EmptyLevel(PathBuf),
}
