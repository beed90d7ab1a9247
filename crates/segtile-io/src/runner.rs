//! The reader -> inference -> writer pipeline.
//!
//! ```text
//! files ─▶ read_requests ─▶ [readers] ─▶ read_results ─▶ inference ─▶ write_requests ─▶ [writers] ─▶ write_acks
//! ```
//!
//! Readers and writers are OS threads inside one [`std::thread::scope`];
//! inference runs on the calling thread, one image at a time. The queues
//! between stages are bounded [`Pipe`]s sized so that at most one decoded
//! image per reader and one result per writer is in flight. The run ends
//! after one acknowledgement per file has been received; every pipe is
//! then closed so blocked workers return and the scope can join them.
//!
//! Any sample, inference or write error aborts the run. Results already
//! handed to the writers are still written, everything else pending is
//! dropped, and the first error is returned. A worker that panics closes
//! every pipe on its way out, so the run ends with
//! [`RunError::WorkersStopped`] instead of waiting for it.

use std::io;
use std::path::PathBuf;
use std::thread;
use std::thread::ScopedJoinHandle;
use std::time::Instant;

use segtile_pipeline::{
    AnnoClasses, ClassGains, ConfigError, GrayImage, InferenceAdapter, InferenceError,
    InferenceScratch, Reduction, ResizeFilter, ScoringModel, TilingParameters,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discover::ImagePaths;
use crate::pipe::{CancelToken, Pipe};
use crate::report::RunReport;
use crate::sample::{DecodedSample, ReadOptions, SampleError, read_sample};
use crate::writer::{ResultImage, WriteError, write_result};

/// Settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Decode threads. Zero is treated as one.
    pub reader_threads: usize,
    /// Resize-and-encode threads. Zero is treated as one.
    pub writer_threads: usize,
    pub tiling: TilingParameters,
    pub read: ReadOptions,
    pub reduction: Reduction,
    /// Filter used when writers restore results to the original size.
    pub restore_filter: ResizeFilter,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            reader_threads: 1,
            writer_threads: 1,
            tiling: TilingParameters::default(),
            read: ReadOptions::default(),
            reduction: Reduction::default(),
            restore_filter: ResizeFilter::default(),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The model, classes, gains and reduction do not fit together.
    #[error("cannot set up inference: {0}")]
    Setup(#[source] InferenceError),

    #[error("{}: {source}", path.display())]
    Sample {
        path: PathBuf,
        #[source]
        source: SampleError,
    },

    #[error("inference failed on {}: {source}", path.display())]
    Inference {
        path: PathBuf,
        #[source]
        source: InferenceError,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("run cancelled")]
    Cancelled,

    /// A pipe closed while work was still expected.
    #[error("pipeline workers stopped before all images were processed")]
    WorkersStopped,
}

/// The four queues of one run.
struct Pipes {
    read_requests: Pipe<ImagePaths>,
    read_results: Pipe<DecodedSample>,
    write_requests: Pipe<ResultImage>,
    write_acks: Pipe<Result<PathBuf, WriteError>>,
}

impl Pipes {
    fn new(total: usize, readers: usize, writers: usize, cancel: &CancelToken) -> Self {
        Self {
            read_requests: Pipe::new(total, cancel),
            read_results: Pipe::new(readers, cancel),
            write_requests: Pipe::new(writers, cancel),
            write_acks: Pipe::new(total, cancel),
        }
    }

    fn close(&self) {
        self.read_requests.close();
        self.read_results.close();
        self.write_requests.close();
        self.write_acks.close();
    }
}

/// Closes every pipe if the owning worker thread unwinds.
struct CloseOnPanic<'a>(&'a Pipes);

impl Drop for CloseOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let current = thread::current();
            warn!(
                thread = current.name().unwrap_or("unnamed"),
                "pipeline worker panicked, closing all pipes"
            );
            self.0.close();
        }
    }
}

fn stopped(cancel: &CancelToken) -> RunError {
    if cancel.is_cancelled() {
        RunError::Cancelled
    } else {
        RunError::WorkersStopped
    }
}

/// Process every file in `files` and write one result image per file.
///
/// Blocks until all results are written or the run fails. Configuration
/// is checked before any thread starts.
///
/// # Errors
///
/// Returns [`RunError::Config`] or [`RunError::Setup`] for inconsistent
/// settings, the first sample, inference or write failure, and
/// [`RunError::Cancelled`] when `cancel` fires.
pub fn run<M: ScoringModel + ?Sized>(
    files: Vec<ImagePaths>,
    model: &M,
    classes: &AnnoClasses,
    gains: &ClassGains,
    config: &RunConfig,
    cancel: &CancelToken,
) -> Result<RunReport, RunError> {
    let started = Instant::now();
    config.tiling.validate(model.required_input_dimension())?;
    let adapter = InferenceAdapter::for_classes(model, classes, gains, config.reduction)
        .map_err(RunError::Setup)?;

    let total = files.len();
    let readers = config.reader_threads.max(1);
    let writers = config.writer_threads.max(1);
    if total == 0 {
        info!("no images to process");
        return Ok(RunReport {
            images_processed: 0,
            images_written: 0,
            tiles: 0,
            inference_duration: started.elapsed(),
            total_duration: started.elapsed(),
        });
    }

    let pipes = Pipes::new(total, readers, writers, cancel);
    for paths in files {
        // Capacity equals the file count, so this only fails on cancel.
        if pipes.read_requests.enqueue(paths).is_err() {
            return Err(RunError::Cancelled);
        }
    }

    info!(images = total, readers, writers, "starting pipeline");
    thread::scope(|scope| {
        let mut workers = Vec::with_capacity(readers + writers);
        let outcome = spawn_workers(
            scope,
            &pipes,
            classes,
            config,
            (readers, writers),
            &mut workers,
        )
        .and_then(|()| infer_all(&adapter, &pipes, total, config, cancel, started));
        pipes.close();
        // Joined here so a panicked worker surfaces as the run's error
        // rather than as a panic out of the scope.
        let panicked = workers
            .into_iter()
            .map(ScopedJoinHandle::join)
            .filter(Result::is_err)
            .count();
        if panicked > 0 {
            warn!(panicked, "pipeline workers panicked");
        }
        outcome
    })
}

fn spawn_workers<'scope, 'env>(
    scope: &'scope thread::Scope<'scope, 'env>,
    pipes: &'env Pipes,
    classes: &'env AnnoClasses,
    config: &'env RunConfig,
    (readers, writers): (usize, usize),
    workers: &mut Vec<ScopedJoinHandle<'scope, ()>>,
) -> Result<(), RunError> {
    for index in 0..readers {
        let worker = thread::Builder::new()
            .name(format!("reader-{index}"))
            .spawn_scoped(scope, move || read_stage(pipes, classes, &config.read))
            .map_err(RunError::Spawn)?;
        workers.push(worker);
    }
    for index in 0..writers {
        let worker = thread::Builder::new()
            .name(format!("writer-{index}"))
            .spawn_scoped(scope, move || write_stage(pipes, config.restore_filter))
            .map_err(RunError::Spawn)?;
        workers.push(worker);
    }
    Ok(())
}

fn read_stage(pipes: &Pipes, classes: &AnnoClasses, options: &ReadOptions) {
    let _guard = CloseOnPanic(pipes);
    debug!("reader started");
    while let Some(paths) = pipes.read_requests.dequeue() {
        let sample = read_sample(paths, classes, options);
        if let Err(error) = &sample.decoded {
            debug!(image = %sample.paths.image.display(), %error, "sample failed to decode");
        }
        if pipes.read_results.enqueue(sample).is_err() {
            break;
        }
    }
    debug!("reader stopped");
}

fn write_stage(pipes: &Pipes, filter: ResizeFilter) {
    let _guard = CloseOnPanic(pipes);
    debug!("writer started");
    while let Some(result) = pipes.write_requests.dequeue() {
        let written = write_result(result, filter);
        match &written {
            Ok(path) => debug!(path = %path.display(), "result written"),
            Err(error) => warn!(%error, "result write failed"),
        }
        if pipes.write_acks.enqueue(written).is_err() {
            break;
        }
    }
    debug!("writer stopped");
}

/// Counters of the inference loop.
#[derive(Debug, Default)]
struct Progress {
    tiles: usize,
    /// Results handed to the writers.
    enqueued: usize,
    /// Acknowledgements received, successful or not.
    acked: usize,
    written: usize,
}

impl Progress {
    fn record(&mut self, ack: Result<PathBuf, WriteError>) -> Result<(), WriteError> {
        self.acked += 1;
        ack.map(|_| self.written += 1)
    }
}

/// The calling thread's part of the run: infer every sample, hand results
/// to the writers, then wait for their acknowledgements.
fn infer_all<M: ScoringModel + ?Sized>(
    adapter: &InferenceAdapter<'_, M>,
    pipes: &Pipes,
    total: usize,
    config: &RunConfig,
    cancel: &CancelToken,
    started: Instant,
) -> Result<RunReport, RunError> {
    let mut progress = Progress::default();
    let inferred = infer_each(adapter, pipes, total, config, cancel, &mut progress);
    let inference_duration = started.elapsed();
    if inferred.is_ok() {
        info!(
            "All {total} images processed in {:.3} seconds!",
            inference_duration.as_secs_f64()
        );
    }

    let settled = wait_for_writes(pipes, cancel, &mut progress);
    inferred?;
    settled?;
    info!(images = progress.written, "all result images written");

    Ok(RunReport {
        images_processed: total,
        images_written: progress.written,
        tiles: progress.tiles,
        inference_duration,
        total_duration: started.elapsed(),
    })
}

fn infer_each<M: ScoringModel + ?Sized>(
    adapter: &InferenceAdapter<'_, M>,
    pipes: &Pipes,
    total: usize,
    config: &RunConfig,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<(), RunError> {
    let mut scratch = InferenceScratch::new();

    for index in 1..=total {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let Some(DecodedSample { paths, decoded }) = pipes.read_results.dequeue() else {
            return Err(stopped(cancel));
        };
        info!(image = %paths.image.display(), "processing image {index} of {total}");

        let decoded = decoded.map_err(|source| RunError::Sample {
            path: paths.image.clone(),
            source,
        })?;
        let mut probability_image = GrayImage::new(decoded.image.width(), decoded.image.height());
        let inference = adapter
            .infer_image(&decoded.image, &config.tiling, &mut scratch, &mut probability_image)
            .map_err(|source| RunError::Inference {
                path: paths.image.clone(),
                source,
            })?;
        progress.tiles += inference.tiles;
        debug!(tiles = inference.tiles, "image inferred");

        let result = ResultImage {
            output_path: paths.output_path(),
            original: decoded.original,
            probability_image,
        };
        if pipes.write_requests.enqueue(result).is_err() {
            return Err(stopped(cancel));
        }
        progress.enqueued += 1;

        // Surface write failures without waiting for the end of the run.
        while let Some(ack) = pipes.write_acks.try_dequeue() {
            progress.record(ack)?;
        }
    }
    Ok(())
}

/// Wait until every result handed to the writers is acknowledged.
///
/// Runs on failure too, so that outputs of images that were already
/// inferred are complete on disk when the run returns.
fn wait_for_writes(
    pipes: &Pipes,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<(), RunError> {
    let mut first_error = None;
    while progress.acked < progress.enqueued {
        let Some(ack) = pipes.write_acks.dequeue() else {
            return Err(stopped(cancel));
        };
        if let Err(error) = progress.record(ack) {
            first_error.get_or_insert(error);
        }
    }
    first_error.map_or(Ok(()), |error| Err(error.into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::cast_possible_truncation)]
mod tests {
    use std::path::Path;

    use segtile_pipeline::{ClassScores, Dimensions, ModelError};

    use super::*;

    /// Two classes; class 1 scores the normalized pixel intensity.
    struct IntensityModel;

    impl ScoringModel for IntensityModel {
        fn required_input_dimension(&self) -> u32 {
            4
        }

        fn class_count(&self) -> usize {
            2
        }

        fn forward(&self, tile: &GrayImage, scores: &mut ClassScores) -> Result<(), ModelError> {
            for (i, pixel) in tile.as_raw().iter().enumerate() {
                scores.plane_mut(0)[i] = 0.0;
                scores.plane_mut(1)[i] = f32::from(*pixel) / 32.0 - 4.0;
            }
            Ok(())
        }
    }

    fn write_image(path: &Path, width: u32, height: u32) {
        GrayImage::from_fn(width, height, |x, y| image::Luma([((x + y) % 256) as u8]))
            .save(path)
            .unwrap();
    }

    fn config() -> RunConfig {
        RunConfig {
            reader_threads: 2,
            writer_threads: 2,
            tiling: TilingParameters::new(16, 16, 4),
            ..RunConfig::default()
        }
    }

    #[test]
    fn empty_run_reports_nothing() {
        let report = run(
            Vec::new(),
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.images_processed, 0);
        assert_eq!(report.tiles, 0);
    }

    #[test]
    fn writes_one_result_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for (name, w, h) in [("a.png", 40, 30), ("b.png", 7, 9), ("c.png", 16, 16)] {
            let path = dir.path().join(name);
            write_image(&path, w, h);
            files.push(ImagePaths::unlabeled(path));
        }

        let report = run(
            files.clone(),
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.images_processed, 3);
        assert_eq!(report.images_written, 3);

        for (paths, expected) in files.iter().zip([(40, 30), (7, 9), (16, 16)]) {
            let output = image::open(paths.output_path()).unwrap();
            assert_eq!(
                Dimensions::new(output.width(), output.height()),
                Dimensions::new(expected.0, expected.1)
            );
        }
    }

    #[test]
    fn tiling_below_model_minimum_fails_before_starting() {
        let config = RunConfig {
            tiling: TilingParameters::new(2, 2, 0),
            ..config()
        };
        let err = run(
            vec![ImagePaths::unlabeled(PathBuf::from("never-read.png"))],
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }

    #[test]
    fn gain_count_mismatch_fails_before_starting() {
        let err = run(
            Vec::new(),
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(3),
            &config(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RunError::Setup(InferenceError::ClassCountMismatch { .. })
        ));
    }

    #[test]
    fn cancelled_token_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_image(&path, 8, 8);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run(
            vec![ImagePaths::unlabeled(path.clone())],
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
        assert!(!ImagePaths::unlabeled(path).output_path().exists());
    }

    #[test]
    fn sample_error_names_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"garbage").unwrap();

        let err = run(
            vec![ImagePaths::unlabeled(path.clone())],
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config(),
            &CancelToken::new(),
        )
        .unwrap_err();
        match err {
            RunError::Sample { path: failed, .. } => assert_eq!(failed, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panicking_worker_closes_every_pipe() {
        let cancel = CancelToken::new();
        let pipes = Pipes::new(4, 1, 1, &cancel);
        {
            let _guard = CloseOnPanic(&pipes);
        }
        assert!(!pipes.read_results.is_closed());

        thread::scope(|scope| {
            let worker = scope.spawn(|| {
                let _guard = CloseOnPanic(&pipes);
                panic!("decoder blew up");
            });
            // Would block forever if the guard did not close the pipe.
            assert!(pipes.read_results.dequeue().is_none());
            assert!(worker.join().is_err());
        });
        assert!(pipes.read_requests.is_closed());
        assert!(pipes.write_acks.is_closed());
        assert!(matches!(stopped(&cancel), RunError::WorkersStopped));
    }

    #[test]
    fn image_smaller_than_model_minimum_is_an_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        write_image(&path, 3, 3);

        let err = run(
            vec![ImagePaths::unlabeled(path)],
            &IntensityModel,
            &AnnoClasses::defaults(),
            &ClassGains::zero(2),
            &config(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Inference { .. }));
    }
}
