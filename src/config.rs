use std::{num::NonZeroUsize, path::PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    model::{Objective, SoftmaxLinear},
    orchestra::{Result, TrainError},
    synchronization::UpdateDiscipline,
};

const DEFAULT_WINDOW_FRAMES: NonZeroUsize = NonZeroUsize::new(32768).unwrap();
const DEFAULT_MINIBATCH_SIZE: NonZeroUsize = NonZeroUsize::new(256).unwrap();

/// Execution parameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TrainConfig {
    /// The amount of worker threads.
    pub num_workers: NonZeroUsize,
    /// Repository capacity, defaults to `num_workers`.
    pub queue_capacity: Option<NonZeroUsize>,
    /// Frames a worker accumulates before shuffling and training on them.
    pub window_frames: NonZeroUsize,
    pub minibatch_size: NonZeroUsize,
    /// Evaluate only, the model is never updated.
    pub crossvalidate: bool,
    pub randomize: bool,
    /// Base seed for the shuffling permutations, worker `i` uses `seed + i`.
    pub seed: u64,
    /// Utterances longer than this are skipped.
    pub max_frames: usize,
    /// Maximum row count difference that gets truncated instead of rejected.
    pub length_tolerance: usize,
    pub discipline: UpdateDiscipline,
    /// Log producer progress every this many utterances, `0` disables it.
    pub progress_utterances: usize,
    /// Log worker progress every this many frames, `0` disables it.
    pub progress_frames: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_workers: NonZeroUsize::MIN,
            queue_capacity: None,
            window_frames: DEFAULT_WINDOW_FRAMES,
            minibatch_size: DEFAULT_MINIBATCH_SIZE,
            crossvalidate: false,
            randomize: true,
            seed: 777,
            max_frames: 360_000,
            length_tolerance: 5,
            discipline: UpdateDiscipline::default(),
            progress_utterances: 5_000,
            progress_frames: 100_000,
        }
    }
}

impl TrainConfig {
    /// The repository capacity actually used.
    pub fn queue_capacity(&self) -> NonZeroUsize {
        self.queue_capacity.unwrap_or(self.num_workers)
    }

    /// Whether windows get shuffled before training on them.
    pub fn shuffles(&self) -> bool {
        self.randomize && !self.crossvalidate
    }

    /// Checks the values that can't be expressed in the types.
    ///
    /// # Returns
    /// A `TrainError::InvalidConfig` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(TrainError::InvalidConfig("max_frames must be positive".into()));
        }

        if self.minibatch_size > self.window_frames {
            return Err(TrainError::InvalidConfig(format!(
                "minibatch_size ({}) must not exceed window_frames ({})",
                self.minibatch_size, self.window_frames
            )));
        }

        if self.queue_capacity() < self.num_workers {
            warn!(
                "queue_capacity ({}) is below num_workers ({}), some workers will idle",
                self.queue_capacity(),
                self.num_workers
            );
        }

        Ok(())
    }
}

/// Shape and hyperparameters of the reference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub objective: Objective,
}

fn default_learning_rate() -> f32 {
    0.008
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(TrainError::InvalidConfig(
                "model dimensions must be positive".into(),
            ));
        }

        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return Err(TrainError::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }

        Ok(())
    }

    /// Builds a freshly initialized model.
    pub fn build(&self) -> SoftmaxLinear {
        SoftmaxLinear::new(
            self.input_dim,
            self.output_dim,
            self.learning_rate,
            self.objective,
        )
    }
}

/// Everything the `frmshuff-train` binary needs, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// JSON-lines file of `{"key", "feats"}` records.
    pub features: PathBuf,
    /// JSON-lines table of target posteriors.
    pub targets: PathBuf,
    #[serde(default)]
    pub frame_weights: Option<PathBuf>,
    #[serde(default)]
    pub utt_weights: Option<PathBuf>,
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainConfig,
}

impl RunConfig {
    /// Parses and validates a `RunConfig`.
    ///
    /// # Arguments
    /// * `json` - The configuration document.
    ///
    /// # Returns
    /// The configuration or a `TrainError::InvalidConfig`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrainError::InvalidConfig(format!("invalid JSON: {e}")))?;

        config.model.validate()?;
        config.training.validate()?;
        Ok(config)
    }
}
