use std::{error::Error, fmt};

use ndarray::{s, Array1, Array2};

/// Sparse per-frame target distributions, one list of `(class, probability)` pairs per frame.
pub type Posterior = Vec<Vec<(usize, f32)>>;

/// Errors found while validating a single sample. These are always local to the
/// offending item: it gets skipped and counted, training goes on.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleError {
    RowMismatch {
        key: String,
        feats: usize,
        targets: usize,
        weights: usize,
    },
    DimMismatch {
        key: String,
        got: usize,
        expected: usize,
    },
    InvalidWeight {
        key: String,
        weight: f32,
    },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::RowMismatch {
                key,
                feats,
                targets,
                weights,
            } => write!(
                f,
                "{key}: row count mismatch, feats={feats} targets={targets} weights={weights}"
            ),
            SampleError::DimMismatch { key, got, expected } => {
                write!(f, "{key}: feature dim {got}, expected {expected}")
            }
            SampleError::InvalidWeight { key, weight } => {
                write!(f, "{key}: invalid utterance weight {weight}")
            }
        }
    }
}

impl Error for SampleError {}

/// A single training utterance: features, targets and weights aligned by frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    key: String,
    feats: Array2<f32>,
    targets: Posterior,
    weights: Array1<f32>,
}

impl Sample {
    /// Creates a new `Sample` without checking row alignment, call `validate` for that.
    ///
    /// # Arguments
    /// * `key` - The utterance identifier, used for diagnostics.
    /// * `feats` - The input tensor, one row per frame.
    /// * `targets` - One target distribution per frame.
    /// * `weights` - One weight per frame.
    pub fn new(
        key: impl Into<String>,
        feats: Array2<f32>,
        targets: Posterior,
        weights: Array1<f32>,
    ) -> Self {
        Self {
            key: key.into(),
            feats,
            targets,
            weights,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn feats(&self) -> &Array2<f32> {
        &self.feats
    }

    pub fn targets(&self) -> &Posterior {
        &self.targets
    }

    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }

    /// The amount of frames, taken from the input tensor.
    pub fn frames(&self) -> usize {
        self.feats.nrows()
    }

    /// The feature dimension of every frame.
    pub fn dim(&self) -> usize {
        self.feats.ncols()
    }

    /// Checks `feats.rows == targets.rows == weights.rows`.
    ///
    /// # Returns
    /// A `SampleError::RowMismatch` if any of the three disagree.
    pub fn validate(&self) -> Result<(), SampleError> {
        let (feats, targets, weights) = self.row_counts();

        if feats != targets || feats != weights {
            return Err(self.row_mismatch());
        }

        Ok(())
    }

    /// Truncates the three tensors to the shortest one when their row counts
    /// differ by at most `tolerance` frames.
    ///
    /// # Returns
    /// A `SampleError::RowMismatch` if the difference is larger than `tolerance`,
    /// in which case the sample is left untouched.
    pub fn reconcile_lengths(&mut self, tolerance: usize) -> Result<(), SampleError> {
        let (feats, targets, weights) = self.row_counts();
        let min = feats.min(targets).min(weights);
        let max = feats.max(targets).max(weights);

        if max - min > tolerance {
            return Err(self.row_mismatch());
        }

        if max != min {
            self.feats = self.feats.slice(s![..min, ..]).to_owned();
            self.targets.truncate(min);
            self.weights = self.weights.slice(s![..min]).to_owned();
        }

        Ok(())
    }

    /// Multiplies every frame weight by `weight`.
    pub fn scale_weights(&mut self, weight: f32) {
        self.weights *= weight;
    }

    /// Splits the sample into `(key, feats, targets, weights)`.
    pub fn into_parts(self) -> (String, Array2<f32>, Posterior, Array1<f32>) {
        (self.key, self.feats, self.targets, self.weights)
    }

    fn row_counts(&self) -> (usize, usize, usize) {
        (self.feats.nrows(), self.targets.len(), self.weights.len())
    }

    fn row_mismatch(&self) -> SampleError {
        let (feats, targets, weights) = self.row_counts();

        SampleError::RowMismatch {
            key: self.key.clone(),
            feats,
            targets,
            weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(feats: usize, targets: usize, weights: usize) -> Sample {
        Sample::new(
            "utt",
            Array2::zeros((feats, 2)),
            vec![vec![(0, 1.0)]; targets],
            Array1::ones(weights),
        )
    }

    #[test]
    fn aligned_sample_is_valid() {
        assert!(sample(3, 3, 3).validate().is_ok());
    }

    #[test]
    fn misaligned_sample_is_rejected() {
        let err = sample(3, 2, 3).validate().unwrap_err();
        assert_eq!(
            err,
            SampleError::RowMismatch {
                key: "utt".into(),
                feats: 3,
                targets: 2,
                weights: 3,
            }
        );
    }

    #[test]
    fn small_length_mismatch_is_truncated_to_the_shortest() {
        let mut s = sample(10, 8, 9);
        s.reconcile_lengths(5).unwrap();

        assert_eq!(s.frames(), 8);
        assert_eq!(s.targets().len(), 8);
        assert_eq!(s.weights().len(), 8);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn large_length_mismatch_is_left_untouched() {
        let mut s = sample(10, 2, 10);
        assert!(s.reconcile_lengths(5).is_err());
        assert_eq!(s.frames(), 10);
        assert_eq!(s.targets().len(), 2);
    }

    #[test]
    fn scaling_weights() {
        let mut s = sample(2, 2, 2);
        s.scale_weights(0.5);
        assert_eq!(s.weights().to_vec(), vec![0.5, 0.5]);
    }
}
