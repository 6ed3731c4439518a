mod linear;

use std::fmt;

pub use linear::{Objective, SoftmaxLinear};

use crate::orchestra::Batch;

/// Errors produced by a model while applying a minibatch. These are fatal for the
/// worker that hit them.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(&'static str),

    /// A shape invariant was violated (e.g. mismatched lengths).
    ShapeMismatch {
        /// Human-readable context for the mismatch (e.g. "input dim", "target class").
        what: &'static str,
        /// Observed value.
        got: usize,
        /// Expected value.
        expected: usize,
    },

    /// The objective or the parameters stopped being finite numbers.
    NonFinite(&'static str),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ModelError::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                write!(f, "shape mismatch for {what}: got {got}, expected {expected}")
            }
            ModelError::NonFinite(what) => write!(f, "non-finite value in {what}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Statistics produced by applying a single minibatch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepStats {
    frames: usize,
    objective: f64,
}

impl StepStats {
    /// Creates a new `StepStats`.
    ///
    /// # Args
    /// * `frames` - Number of frames in the minibatch.
    /// * `objective` - The weighted objective summed over those frames.
    pub fn new(frames: usize, objective: f64) -> Self {
        Self { frames, objective }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }
}

/// The model-update collaborator workers feed their minibatches to.
///
/// Implementations own the numeric side: forward pass, objective evaluation and,
/// unless `eval` is set, the backward pass and parameter update. The workers treat
/// it as a black box, how it's shared between them is decided by a `Synchronizer`.
pub trait Model: Send {
    /// Applies one minibatch.
    ///
    /// # Args
    /// * `batch` - Row-aligned features, targets and per-frame weights.
    /// * `eval` - Only evaluate the objective, leave the parameters untouched.
    ///
    /// # Returns
    /// Step-level statistics on success.
    ///
    /// # Errors
    /// Returns `ModelError` when the batch doesn't fit the model or the numbers blow up.
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError>;

    /// The flat parameter buffer, replicas are averaged over it.
    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    /// The feature dimension every frame must have, `None` if the model takes any.
    fn feature_dim(&self) -> Option<usize> {
        None
    }

    /// A human-readable report of the model's state for the logs.
    fn info(&self) -> String {
        String::new()
    }
}

impl<T: Model + ?Sized> Model for Box<T> {
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError> {
        (**self).step(batch, eval)
    }

    fn params(&self) -> &[f32] {
        (**self).params()
    }

    fn params_mut(&mut self) -> &mut [f32] {
        (**self).params_mut()
    }

    fn feature_dim(&self) -> Option<usize> {
        (**self).feature_dim()
    }

    fn info(&self) -> String {
        (**self).info()
    }
}
