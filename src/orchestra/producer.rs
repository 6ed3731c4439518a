use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use tokio_util::sync::CancellationToken;

use super::{
    error::{Result, TrainError},
    ExampleRepository,
};
use crate::{
    config::TrainConfig,
    metrics::ProducerStats,
    reader::SampleSource,
    sample::{Sample, SampleError},
};

/// The reading side of a run: it turns the feature stream and lookup tables into
/// validated samples and hands them to the repository.
pub struct Producer {
    feature_dim: Option<usize>,
    max_frames: usize,
    length_tolerance: usize,
    progress_utterances: u64,
    stats: ProducerStats,
}

impl Producer {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            feature_dim: None,
            max_frames: config.max_frames,
            length_tolerance: config.length_tolerance,
            progress_utterances: config.progress_utterances as u64,
            stats: ProducerStats::default(),
        }
    }

    /// Pins the feature dimension every utterance must have.
    ///
    /// Without it the dimension is taken from the first accepted utterance.
    pub fn with_feature_dim(mut self, dim: Option<usize>) -> Self {
        self.feature_dim = dim;
        self
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    pub fn into_stats(self) -> ProducerStats {
        self.stats
    }

    /// Reads `source` to the end, submitting every acceptable utterance.
    ///
    /// It doesn't close the repository, that's up to the caller.
    ///
    /// # Errors
    /// A `TrainError::Reader` if the feature stream fails, or `TrainError::Cancelled` if
    /// the run got cancelled, in which case the repository may be already aborted.
    pub fn run(
        &mut self,
        repository: &ExampleRepository<Sample>,
        source: &mut SampleSource,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(item) = source.features.next() {
            if cancel.is_cancelled() {
                return Err(TrainError::Cancelled);
            }

            let (key, feats) = item?;
            self.stats.read += 1;

            if let Some(sample) = self.assemble(key, feats, source) {
                let frames = sample.frames() as u64;

                if repository.submit(sample).is_err() {
                    return Err(if cancel.is_cancelled() {
                        TrainError::Cancelled
                    } else {
                        TrainError::Protocol("the example repository was closed while producing")
                    });
                }

                self.stats.submitted += 1;
                self.stats.frames_submitted += frames;
            }

            if self.progress_utterances > 0 && self.stats.read % self.progress_utterances == 0 {
                info!(
                    "{} utterances read, {} submitted, {} frames",
                    self.stats.read, self.stats.submitted, self.stats.frames_submitted
                );
            }
        }

        Ok(())
    }

    /// Looks up everything belonging to `key` and builds its sample.
    ///
    /// # Returns
    /// The sample ready to be submitted, or `None` if the utterance must be skipped, in
    /// which case the reason was logged and counted.
    pub fn assemble(
        &mut self,
        key: String,
        feats: Array2<f32>,
        source: &SampleSource,
    ) -> Option<Sample> {
        let Some(targets) = source.targets.lookup(&key) else {
            warn!("{key}, missing targets");
            self.stats.missing_targets += 1;
            return None;
        };

        let frames = feats.nrows();

        let weights = match &source.frame_weights {
            Some(table) => match table.lookup(&key) {
                Some(weights) => Array1::from(weights.clone()),
                None => {
                    warn!("{key}, missing per-frame weights");
                    self.stats.missing_weights += 1;
                    return None;
                }
            },
            None => Array1::ones(frames),
        };

        let utt_weight = match &source.utt_weights {
            Some(table) => match table.lookup(&key) {
                Some(&weight) => Some(weight),
                None => {
                    warn!("{key}, missing per-utterance weight");
                    self.stats.missing_weights += 1;
                    return None;
                }
            },
            None => None,
        };

        if frames > self.max_frames {
            warn!(
                "{key}, too long ({frames} frames, max_frames is {})",
                self.max_frames
            );
            self.stats.too_long += 1;
            return None;
        }

        let dim = feats.ncols();
        if let Some(expected) = self.feature_dim.filter(|&expected| expected != dim) {
            let e = SampleError::DimMismatch {
                key,
                got: dim,
                expected,
            };
            warn!("skipping utterance, {e}");
            self.stats.rejected += 1;
            return None;
        }

        let mut sample = Sample::new(key, feats, targets.clone(), weights);

        if let Err(e) = sample.reconcile_lengths(self.length_tolerance) {
            warn!("skipping utterance, {e}");
            self.stats.rejected += 1;
            return None;
        }

        if let Some(weight) = utt_weight {
            if !weight.is_finite() || weight < 0. {
                let e = SampleError::InvalidWeight {
                    key: sample.key().to_string(),
                    weight,
                };
                warn!("skipping utterance, {e}");
                self.stats.rejected += 1;
                return None;
            }

            if weight == 0. {
                debug!("{}, zero utterance weight", sample.key());
                self.stats.zero_weight += 1;
                return None;
            }

            sample.scale_weights(weight);
        }

        self.feature_dim.get_or_insert(dim);
        Some(sample)
    }
}
