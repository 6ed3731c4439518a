use std::{
    io,
    num::NonZeroUsize,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{debug, error, info, trace, warn};
use rand::{rngs::StdRng, SeedableRng};
use tokio_util::sync::CancellationToken;

use super::{
    error::{Result, TrainError},
    random_permutation, ExampleRepository, ShuffleWindow,
};
use crate::{
    config::TrainConfig, metrics::WorkerMetrics, sample::Sample, synchronization::Synchronizer,
};

/// Where a worker is in its fill/process cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Filling,
    Processing,
    Stopped,
}

/// The part of the run configuration a worker cares about.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub window_frames: NonZeroUsize,
    pub minibatch_size: NonZeroUsize,
    pub eval: bool,
    pub shuffle: bool,
    pub seed: u64,
    pub progress_frames: usize,
}

impl From<&TrainConfig> for WorkerSettings {
    fn from(config: &TrainConfig) -> Self {
        Self {
            window_frames: config.window_frames,
            minibatch_size: config.minibatch_size,
            eval: config.crossvalidate,
            shuffle: config.shuffles(),
            seed: config.seed,
            progress_frames: config.progress_frames,
        }
    }
}

/// Releases everyone else if the owning worker thread unwinds.
struct ShutdownGuard {
    repository: Arc<ExampleRepository<Sample>>,
    cancel: CancellationToken,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.cancel.cancel();
            self.repository.abort();
        }
    }
}

/// A consumer thread of the example repository.
///
/// It fills its `ShuffleWindow` from the repository, shuffles it, feeds it to the model
/// in minibatches and starts over, until the repository is closed and drained.
pub struct Worker {
    worker_id: usize,
    repository: Arc<ExampleRepository<Sample>>,
    window: ShuffleWindow,
    sync: Box<dyn Synchronizer>,
    settings: WorkerSettings,
    rng: StdRng,
    cancel: CancellationToken,
    state: WorkerState,
    exhausted: bool,
    metrics: WorkerMetrics,
}

impl Worker {
    /// Creates a new `Worker`.
    ///
    /// # Args
    /// * `worker_id` - Identifier used for observability and seeding.
    /// * `repository` - The repository to consume from.
    /// * `sync` - This worker's handle to the shared model.
    /// * `settings` - Window and minibatch configuration.
    /// * `cancel` - The run-wide cancellation token.
    ///
    /// # Returns
    /// A new worker instance.
    pub fn new(
        worker_id: usize,
        repository: Arc<ExampleRepository<Sample>>,
        sync: Box<dyn Synchronizer>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            repository,
            window: ShuffleWindow::new(settings.window_frames),
            sync,
            rng: StdRng::seed_from_u64(settings.seed.wrapping_add(worker_id as u64)),
            settings,
            cancel,
            state: WorkerState::Filling,
            exhausted: false,
            metrics: WorkerMetrics::new(worker_id),
        }
    }

    pub fn id(&self) -> usize {
        self.worker_id
    }

    /// Runs the worker on a new thread named `worker-{id}`.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<WorkerMetrics>>> {
        thread::Builder::new()
            .name(format!("worker-{}", self.worker_id))
            .spawn(move || self.run())
    }

    /// Runs the fill/process cycle until there's no more input.
    ///
    /// # Returns
    /// This worker's metrics on success.
    ///
    /// # Errors
    /// A `TrainError::Model` if the model failed, after which the whole run is cancelled,
    /// or `TrainError::Cancelled` if someone else cancelled it.
    pub fn run(mut self) -> Result<WorkerMetrics> {
        let worker_id = self.worker_id;
        let _guard = ShutdownGuard {
            repository: Arc::clone(&self.repository),
            cancel: self.cancel.clone(),
        };

        debug!(worker_id = worker_id; "worker started");
        let result = self.train();
        self.set_state(WorkerState::Stopped);

        match result {
            Ok(()) => {
                self.sync.leave();
                info!(
                    worker_id = worker_id;
                    "worker finished: {} samples, {} frames, {} windows",
                    self.metrics.samples, self.metrics.frames, self.metrics.windows
                );
                Ok(self.metrics)
            }
            Err(e) => {
                if matches!(e, TrainError::Cancelled) {
                    debug!(worker_id = worker_id; "worker cancelled");
                } else {
                    error!(worker_id = worker_id; "worker failed: {e}");
                }

                self.cancel.cancel();
                self.repository.abort();
                Err(e)
            }
        }
    }

    fn train(&mut self) -> Result<()> {
        loop {
            self.fill()?;
            self.process()?;

            if self.exhausted {
                return Ok(());
            }
        }
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state != next {
            trace!(worker_id = self.worker_id; "{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn fill(&mut self) -> Result<()> {
        self.set_state(WorkerState::Filling);

        while !self.window.is_full() {
            if self.cancel.is_cancelled() {
                return Err(TrainError::Cancelled);
            }

            let start = Instant::now();
            let sample = self.repository.take();
            self.metrics.wait_time += start.elapsed();

            let Some(sample) = sample else {
                if self.cancel.is_cancelled() {
                    return Err(TrainError::Cancelled);
                }

                self.exhausted = true;
                break;
            };

            match self.window.add(sample) {
                Ok(()) => self.metrics.bump_sample(),
                Err(e) => {
                    warn!(worker_id = self.worker_id; "skipping sample, {e}");
                    self.metrics.bump_rejected();
                }
            }
        }

        Ok(())
    }

    fn process(&mut self) -> Result<()> {
        self.set_state(WorkerState::Processing);

        if self.window.is_empty() {
            return Ok(());
        }

        let worker_id = self.worker_id;
        let start = Instant::now();

        if self.settings.shuffle {
            let perm = random_permutation(self.window.len(), &mut self.rng);
            self.window
                .shuffle(&perm)
                .map_err(|_| TrainError::Protocol("shuffle mask is not a permutation"))?;
        }

        let mut drain = self.window.drain();
        while let Some(batch) = drain.next_batch(self.settings.minibatch_size) {
            if self.cancel.is_cancelled() {
                return Err(TrainError::Cancelled);
            }

            if self.metrics.minibatches == 0 {
                info!(worker_id = worker_id; "first minibatch, {}", self.sync.info());
            }

            let stats = self
                .sync
                .step(&batch, self.settings.eval)
                .map_err(|source| TrainError::Model { worker_id, source })?;

            let before = self.metrics.frames;
            self.metrics.add_minibatch(stats.frames(), stats.objective());
            self.log_progress(before);
        }

        self.sync
            .window_done()
            .map_err(|source| TrainError::Model { worker_id, source })?;

        self.metrics.bump_window();
        self.metrics.compute_time += start.elapsed();
        Ok(())
    }

    fn log_progress(&self, before: u64) {
        let every = self.settings.progress_frames as u64;

        if every > 0 && before / every != self.metrics.frames / every {
            debug!(
                worker_id = self.worker_id;
                "{} frames processed, avg objective {:.6}",
                self.metrics.frames,
                self.metrics.avg_objective()
            );
        }
    }
}
