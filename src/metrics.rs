use std::{fmt, time::Duration};

use serde::Serialize;

/// Counters kept by a single worker thread.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerMetrics {
    pub worker_id: usize,

    pub wait_time: Duration,
    pub compute_time: Duration,

    pub windows: u64,
    pub minibatches: u64,
    pub samples: u64,
    pub frames: u64,
    pub rejected: u64,
    pub objective: f64,
}

impl WorkerMetrics {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }

    #[inline]
    pub fn bump_window(&mut self) {
        self.windows += 1;
    }

    #[inline]
    pub fn add_minibatch(&mut self, frames: usize, objective: f64) {
        self.minibatches += 1;
        self.frames += frames as u64;
        self.objective += objective;
    }

    #[inline]
    pub fn bump_sample(&mut self) {
        self.samples += 1;
    }

    #[inline]
    pub fn bump_rejected(&mut self) {
        self.rejected += 1;
    }

    /// The average objective per frame processed by this worker.
    pub fn avg_objective(&self) -> f64 {
        if self.frames == 0 {
            return 0.;
        }

        self.objective / self.frames as f64
    }
}

/// Counters kept by the producer while reading the inputs.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProducerStats {
    /// Utterances read from the feature stream.
    pub read: u64,
    /// Utterances handed to the repository.
    pub submitted: u64,
    pub frames_submitted: u64,
    pub missing_targets: u64,
    pub missing_weights: u64,
    pub zero_weight: u64,
    pub too_long: u64,
    /// Utterances with misaligned rows, the wrong feature dimension or invalid weights.
    pub rejected: u64,
}

impl ProducerStats {
    /// The amount of utterances that were read but never submitted.
    pub fn skipped(&self) -> u64 {
        self.missing_targets
            + self.missing_weights
            + self.zero_weight
            + self.too_long
            + self.rejected
    }
}

/// The end-of-run report.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Summary {
    pub producer: ProducerStats,
    pub workers: Vec<WorkerMetrics>,
    pub elapsed: Duration,
}

impl Summary {
    pub fn processed_samples(&self) -> u64 {
        self.workers.iter().map(|w| w.samples).sum()
    }

    pub fn processed_frames(&self) -> u64 {
        self.workers.iter().map(|w| w.frames).sum()
    }

    /// Samples the workers refused after they left the repository.
    pub fn rejected_by_workers(&self) -> u64 {
        self.workers.iter().map(|w| w.rejected).sum()
    }

    /// The average objective per frame across every worker.
    pub fn avg_objective(&self) -> f64 {
        let frames = self.processed_frames();
        if frames == 0 {
            return 0.;
        }

        self.workers.iter().map(|w| w.objective).sum::<f64>() / frames as f64
    }

    /// Whether any input was skipped along the way.
    pub fn has_skips(&self) -> bool {
        self.producer.skipped() + self.rejected_by_workers() > 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.producer;

        write!(
            f,
            "processed {} utterances ({} frames) in {:.2?}, avg objective {:.6}; \
             read {}, missing targets {}, missing weights {}, zero weight {}, too long {}, \
             rejected {}",
            self.processed_samples(),
            self.processed_frames(),
            self.elapsed,
            self.avg_objective(),
            p.read,
            p.missing_targets,
            p.missing_weights,
            p.zero_weight,
            p.too_long,
            p.rejected + self.rejected_by_workers(),
        )
    }
}

/// What a successful run hands back.
#[derive(Debug)]
pub struct TrainOutcome<M> {
    pub model: M,
    pub summary: Summary,
}
