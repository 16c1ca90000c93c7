//! Off-thread build runs behind a process-wide admission limit of one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{self, JoinHandle};
use tracing::info;

use crate::builder::{build_pyramid, BuildOptions, BuildSummary};
use crate::error::BuildError;
use crate::progress::{Progress, ProgressReporter};
use crate::source::{open_source, SlideSource, SourceKind};

/// Only one slide may be tiled/annotated at a time.
pub const MAX_RUNNING: usize = 1;

/// Post-build step that writes the level-0 annotation overlay
/// (`tile_<row>_<col>.png` files, white = no annotation).
pub trait AnnotationStage: Send + Sync {
    fn annotate(
        &self,
        level0_dir: &std::path::Path,
        overlay_dir: &std::path::Path,
        progress: &ProgressReporter,
    ) -> Result<(), String>;
}

pub enum JobInput {
    Path { slide: PathBuf, kind: SourceKind },
    Source(Box<dyn SlideSource>),
}

pub struct BuildJob {
    pub input: JobInput,
    pub out_dir: PathBuf,
    /// Where the annotation stage writes; ignored without a stage.
    pub overlay_dir: Option<PathBuf>,
    pub options: BuildOptions,
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(BuildSummary),
    Failed(BuildError),
    /// Withdrawn before it was admitted.
    Cancelled,
}

/// Explicitly constructed pipeline handle; clones share the admission lock.
#[derive(Clone)]
pub struct Pipeline {
    admission: Arc<Semaphore>,
    annotator: Option<Arc<dyn AnnotationStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            admission: Arc::new(Semaphore::new(MAX_RUNNING)),
            annotator: None,
        }
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn AnnotationStage>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// Queue a job. Must be called from inside a tokio runtime.
    pub fn submit(&self, job: BuildJob) -> JobHandle {
        let reporter = ProgressReporter::new();
        let progress = reporter.subscribe();
        let admission = self.admission.clone();
        let annotator = self.annotator.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                // A dropped handle closes the channel without cancelling.
                Ok(()) = &mut cancel_rx => {
                    info!("Job withdrawn before admission: {}", job.out_dir.display());
                    return JobOutcome::Cancelled;
                }
                permit = admission.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return JobOutcome::Cancelled,
                },
            };
            let joined = task::spawn_blocking(move || {
                let _permit = permit;
                run_job(job, annotator.as_deref(), &reporter)
            })
            .await;
            match joined {
                Ok(Ok(summary)) => JobOutcome::Completed(summary),
                Ok(Err(err)) => JobOutcome::Failed(err),
                Err(err) => JobOutcome::Failed(BuildError::Worker(err.to_string())),
            }
        });

        JobHandle {
            progress,
            cancel: Mutex::new(Some(cancel_tx)),
            task,
        }
    }

    /// Release the admission lock for good; queued jobs resolve as cancelled.
    pub fn shutdown(&self) {
        self.admission.close();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(
    job: BuildJob,
    annotator: Option<&dyn AnnotationStage>,
    reporter: &ProgressReporter,
) -> Result<BuildSummary, BuildError> {
    reporter.set("Starting", 0);
    let source = match job.input {
        JobInput::Path { slide, kind } => {
            info!("Opening slide: {}", slide.display());
            open_source(&slide, kind, job.options.tile_edge)?
        }
        JobInput::Source(source) => source,
    };
    let summary = build_pyramid(source.as_ref(), &job.out_dir, &job.options, reporter)?;

    if let (Some(stage), Some(overlay_dir)) = (annotator, job.overlay_dir.as_deref()) {
        reporter.set("Starting inference", 0);
        let level0 = job.out_dir.join(crate::core::pyramid::level_dir_name(0));
        stage
            .annotate(&level0, overlay_dir, reporter)
            .map_err(BuildError::Annotation)?;
    }

    reporter.set("Processing complete", 100);
    Ok(summary)
}

pub struct JobHandle {
    progress: watch::Receiver<Progress>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Withdraw a job that is still waiting for admission. Once admitted, a build runs
    /// to completion and `wait` reports its real outcome.
    pub fn cancel(&self) {
        if let Some(tx) = self.cancel.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(());
        }
    }

    pub async fn wait(self) -> JobOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(BuildError::Worker(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ImageSource;
    use image::{Rgba, RgbaImage};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InflightStage {
        current: AtomicUsize,
        max: AtomicUsize,
        calls: AtomicUsize,
    }

    impl AnnotationStage for InflightStage {
        fn annotate(&self, level0: &Path, overlay: &Path, _: &ProgressReporter) -> Result<(), String> {
            let cur = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(cur, Ordering::SeqCst);
            assert!(level0.ends_with("level0"));
            std::fs::create_dir_all(overlay).map_err(|e| e.to_string())?;
            std::thread::sleep(Duration::from_millis(50));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks inside the annotation step until the test releases it.
    struct GateStage {
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl GateStage {
        fn new() -> (std::sync::mpsc::Sender<()>, Arc<GateStage>) {
            let (tx, rx) = std::sync::mpsc::channel();
            (tx, Arc::new(GateStage { release: Mutex::new(rx) }))
        }
    }

    impl AnnotationStage for GateStage {
        fn annotate(&self, _: &Path, _: &Path, _: &ProgressReporter) -> Result<(), String> {
            let rx = self.release.lock().map_err(|e| e.to_string())?;
            rx.recv().map_err(|e| e.to_string())
        }
    }

    fn dark_job(out: PathBuf, overlay: Option<PathBuf>) -> BuildJob {
        let img = RgbaImage::from_pixel(32, 32, Rgba([20, 40, 60, 255]));
        BuildJob {
            input: JobInput::Source(Box::new(ImageSource::from_levels(vec![img], vec![1.0]))),
            out_dir: out,
            overlay_dir: overlay,
            options: BuildOptions {
                tile_edge: 16,
                ..BuildOptions::default()
            },
        }
    }

    #[tokio::test]
    async fn test_job_completes_with_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new();
        let handle = pipeline.submit(dark_job(dir.path().join("slide"), None));
        let progress = handle.progress();
        match handle.wait().await {
            JobOutcome::Completed(summary) => assert_eq!(summary.written(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        let last = progress.borrow().clone();
        assert_eq!(last.status, "Processing complete");
        assert_eq!(last.percent, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admission_serializes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Arc::new(InflightStage {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new().with_annotator(stage.clone());
        let a = pipeline.submit(dark_job(dir.path().join("a"), Some(dir.path().join("a_inference"))));
        let b = pipeline.submit(dark_job(dir.path().join("b"), Some(dir.path().join("b_inference"))));
        assert!(matches!(a.wait().await, JobOutcome::Completed(_)));
        assert!(matches!(b.wait().await, JobOutcome::Completed(_)));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stage.max.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreadable_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new();
        let handle = pipeline.submit(BuildJob {
            input: JobInput::Path {
                slide: dir.path().join("missing.png"),
                kind: SourceKind::Image,
            },
            out_dir: dir.path().join("out"),
            overlay_dir: None,
            options: BuildOptions::default(),
        });
        assert!(matches!(
            handle.wait().await,
            JobOutcome::Failed(BuildError::SourceUnreadable { .. })
        ));
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new();
        pipeline.shutdown();
        let handle = pipeline.submit(dark_job(dir.path().join("x"), None));
        assert!(matches!(handle.wait().await, JobOutcome::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_admission_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (release, gate) = GateStage::new();
        let pipeline = Pipeline::new().with_annotator(gate);
        let handle = pipeline.submit(dark_job(
            dir.path().join("slide"),
            Some(dir.path().join("slide_inference")),
        ));
        let mut progress = handle.progress();
        progress
            .wait_for(|p| p.status == "Starting inference")
            .await
            .unwrap();

        handle.cancel();
        release.send(()).unwrap();
        match handle.wait().await {
            JobOutcome::Completed(summary) => assert_eq!(summary.written(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(dir.path().join("slide/level0/tile_0_0.png").exists());
        assert_eq!(progress.borrow().status, "Processing complete");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_withdraws_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        let (release, gate) = GateStage::new();
        let pipeline = Pipeline::new().with_annotator(gate);
        let first = pipeline.submit(dark_job(
            dir.path().join("a"),
            Some(dir.path().join("a_inference")),
        ));
        let mut progress = first.progress();
        progress
            .wait_for(|p| p.status == "Starting inference")
            .await
            .unwrap();

        // The first job holds the only permit, so this one is still queued.
        let second = pipeline.submit(dark_job(dir.path().join("b"), None));
        second.cancel();
        assert!(matches!(second.wait().await, JobOutcome::Cancelled));
        assert!(!dir.path().join("b").exists());

        release.send(()).unwrap();
        assert!(matches!(first.wait().await, JobOutcome::Completed(_)));
    }
}
