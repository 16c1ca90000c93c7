pub mod builder;
pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod source;
pub mod viewer;

// Re-exports for easy access
pub use builder::{build_pyramid, BuildOptions, BuildSummary};
pub use config::{Settings, ViewerConfig};
pub use core::background::{is_mostly_background, BackgroundConfig};
pub use core::pyramid::{discover_levels, PyramidInfo};
pub use core::TileKey;
pub use error::{BuildError, PyramidError};
pub use pipeline::{BuildJob, JobInput, JobOutcome, Pipeline};
pub use progress::{Progress, ProgressReporter};
pub use source::{ImageSource, SlideSource, SourceKind};
pub use viewer::TileCache;
