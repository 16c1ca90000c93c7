use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use slide_tiler::builder::BuildOptions;
use slide_tiler::config::Settings;
use slide_tiler::core::pyramid::discover_levels;
use slide_tiler::core::ResampleFilter;
use slide_tiler::pipeline::{BuildJob, JobInput, JobOutcome, Pipeline};
use slide_tiler::source::SourceKind;
use slide_tiler::viewer::{NullSurface, TileCache};

#[derive(Parser)]
#[command(name = "slide-tiler", about = "Tile pyramids for gigapixel slides")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON settings file (build + viewer sections)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Tile a slide into <out>/level<N>/tile_<row>_<col>.png
    Build {
        /// Path to the slide (.svs/.ndpi/... with the openslide feature, or png/jpeg/tiff)
        #[arg(long)]
        slide: PathBuf,

        /// Output pyramid directory
        #[arg(long)]
        out: PathBuf,

        /// Tile edge in pixels
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        tile: Option<u32>,

        /// Source reader: auto, openslide, image
        #[arg(long, default_value = "auto")]
        source: String,

        /// Level-0 downscale filter: bilinear, bicubic, lanczos3
        #[arg(long)]
        filter: Option<String>,
    },

    /// List the levels of an existing pyramid
    Inspect {
        #[arg(long)]
        pyramid: PathBuf,
    },

    /// Render what a viewport would show into a PNG
    Snapshot {
        #[arg(long)]
        pyramid: PathBuf,

        #[arg(long)]
        out: PathBuf,

        /// Viewport width in screen pixels
        #[arg(long, default_value_t = 1024)]
        width: u32,

        /// Viewport height in screen pixels
        #[arg(long, default_value_t = 768)]
        height: u32,

        /// Wheel delta applied after fitting (120 ~ one notch); may repeat
        #[arg(long, allow_hyphen_values = true)]
        zoom: Vec<f64>,

        /// Horizontal pan in screen pixels after zooming
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        pan_x: f64,

        /// Vertical pan in screen pixels after zooming
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        pan_y: f64,

        /// Do not composite the annotation overlay
        #[arg(long)]
        no_annotations: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let settings = Settings::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Build {
            slide,
            out,
            tile,
            source,
            filter,
        } => {
            let kind: SourceKind = source.parse().map_err(|e: String| anyhow!(e))?;
            let mut options: BuildOptions = settings.build;
            if let Some(tile) = tile {
                options.tile_edge = tile;
            }
            if let Some(filter) = filter {
                options.filter = filter.parse::<ResampleFilter>().map_err(|e| anyhow!(e))?;
            }
            run_build(slide, out, kind, options)
        }
        Command::Inspect { pyramid } => {
            let info = discover_levels(&pyramid, settings.viewer.tile_edge)?;
            println!(
                "{}: {} levels, {} tiles, tile_edge={}",
                info.root.display(),
                info.level_count(),
                info.tile_count(),
                info.tile_edge
            );
            for level in &info.levels {
                let (cols, rows) = level.grid(info.tile_edge);
                println!(
                    "  level{}: {}x{} px, grid {}x{}, {} tiles",
                    level.index,
                    level.dimensions.0,
                    level.dimensions.1,
                    cols,
                    rows,
                    level.tiles.len()
                );
            }
            Ok(())
        }
        Command::Snapshot {
            pyramid,
            out,
            width,
            height,
            zoom,
            pan_x,
            pan_y,
            no_annotations,
        } => {
            let mut cache = TileCache::open(&pyramid, settings.viewer, NullSurface, (width, height))?;
            if no_annotations && cache.annotations_enabled() {
                cache.toggle_annotations();
            }
            for delta in zoom {
                cache.zoom(delta);
            }
            if pan_x != 0.0 || pan_y != 0.0 {
                cache.pan(pan_x, pan_y);
            }
            let state = *cache.state();
            let image = cache.render_visible();
            image
                .save(&out)
                .with_context(|| format!("writing snapshot {}", out.display()))?;
            println!(
                "level={} scale={:.4} visible=({:.0},{:.0} {:.0}x{:.0}) tiles={} -> {}",
                state.level,
                state.scale,
                state.visible.x,
                state.visible.y,
                state.visible.w,
                state.visible.h,
                cache.loaded_keys().len(),
                out.display()
            );
            Ok(())
        }
    }
}

fn run_build(slide: PathBuf, out: PathBuf, kind: SourceKind, options: BuildOptions) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let pipeline = Pipeline::new();
        let handle = pipeline.submit(BuildJob {
            input: JobInput::Path { slide, kind },
            out_dir: out,
            overlay_dir: None,
            options,
        });

        let mut progress = handle.progress();
        let watcher = tokio::spawn(async move {
            let mut last_percent = None;
            while progress.changed().await.is_ok() {
                let p = progress.borrow_and_update().clone();
                if last_percent != Some(p.percent) {
                    info!("{} {}%", p.status, p.percent);
                    last_percent = Some(p.percent);
                }
            }
        });

        let outcome = handle.wait().await;
        watcher.abort();
        match outcome {
            JobOutcome::Completed(summary) => {
                for level in &summary.levels {
                    println!(
                        "level{}: grid {}x{}, written={} skipped={}",
                        level.level, level.cols, level.rows, level.written, level.skipped
                    );
                }
                println!(
                    "wrote {} tiles to {} in {} ms",
                    summary.written(),
                    summary.out_dir.display(),
                    summary.elapsed_ms
                );
                Ok(())
            }
            JobOutcome::Failed(err) => Err(anyhow!("build failed: {}", err)),
            JobOutcome::Cancelled => Err(anyhow!("build cancelled")),
        }
    })
}
