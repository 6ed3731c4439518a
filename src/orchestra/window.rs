use std::{error::Error, fmt, mem, num::NonZeroUsize, vec};

use ndarray::{Array1, Array2};
use rand::{seq::SliceRandom, Rng};

use crate::sample::{Posterior, Sample, SampleError};

/// Error returned by `ShuffleWindow::shuffle` when the given mask isn't a
/// permutation of the window's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowError {
    pub got: usize,
    pub rows: usize,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShuffleWindow error: a mask of {} indices is not a permutation of {} rows",
            self.got, self.rows
        )
    }
}

impl Error for WindowError {}

/// One row of a drained window.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub feats: Vec<f32>,
    pub target: Vec<(usize, f32)>,
    pub weight: f32,
}

/// A block of consecutive rows handed to the model in a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub feats: Array2<f32>,
    pub targets: Posterior,
    pub weights: Array1<f32>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// A worker-local buffer of frames that gets shuffled before training on it.
///
/// Frames from several samples are stored in three parallel arrays (features, targets
/// and weights) which always hold the same amount of rows. Shuffling per window
/// instead of globally keeps memory bounded while still breaking the input order.
#[derive(Debug)]
pub struct ShuffleWindow {
    threshold: NonZeroUsize,
    dim: usize,
    feats: Vec<f32>,
    targets: Posterior,
    weights: Vec<f32>,
}

impl ShuffleWindow {
    /// Creates a new empty `ShuffleWindow`.
    ///
    /// # Arguments
    /// * `threshold` - The amount of frames after which the window reports being full.
    pub fn new(threshold: NonZeroUsize) -> Self {
        Self {
            threshold,
            dim: 0,
            feats: Vec::new(),
            targets: Vec::with_capacity(threshold.get()),
            weights: Vec::with_capacity(threshold.get()),
        }
    }

    /// Appends every frame of `sample`.
    ///
    /// The window doesn't truncate, callers should check `is_full` before adding.
    ///
    /// # Returns
    /// A `SampleError` if the sample's rows aren't aligned or its feature dimension differs
    /// from the frames already in the window. The window is untouched in that case.
    pub fn add(&mut self, sample: Sample) -> Result<(), SampleError> {
        sample.validate()?;

        if self.is_empty() {
            self.dim = sample.dim();
        } else if sample.dim() != self.dim {
            return Err(SampleError::DimMismatch {
                key: sample.key().to_string(),
                got: sample.dim(),
                expected: self.dim,
            });
        }

        let (_, feats, targets, weights) = sample.into_parts();
        self.feats.extend(feats.iter().copied());
        self.targets.extend(targets);
        self.weights.extend(weights.iter().copied());
        Ok(())
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.threshold.get()
    }

    /// The amount of resident frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.get()
    }

    /// Reorders the three arrays identically, row `i` becomes the old row `perm[i]`.
    ///
    /// # Arguments
    /// * `perm` - A permutation of `0..self.len()`.
    ///
    /// # Returns
    /// A `WindowError` if `perm` isn't a permutation of the window's rows.
    pub fn shuffle(&mut self, perm: &[usize]) -> Result<(), WindowError> {
        let rows = self.len();

        if !is_permutation(perm, rows) {
            return Err(WindowError {
                got: perm.len(),
                rows,
            });
        }

        let dim = self.dim;
        let mut feats = Vec::with_capacity(self.feats.len());
        for &row in perm {
            feats.extend_from_slice(&self.feats[row * dim..(row + 1) * dim]);
        }

        let mut targets: Vec<_> = mem::take(&mut self.targets)
            .into_iter()
            .map(Some)
            .collect();

        self.targets = perm
            .iter()
            .map(|&row| targets[row].take().unwrap_or_default())
            .collect();
        self.weights = perm.iter().map(|&row| self.weights[row]).collect();
        self.feats = feats;
        Ok(())
    }

    /// Moves every resident frame out of the window, leaving it empty for the next round.
    ///
    /// # Returns
    /// A single-use `Drain` over the frames in their current order.
    pub fn drain(&mut self) -> Drain {
        Drain {
            dim: self.dim,
            cursor: 0,
            feats: mem::take(&mut self.feats),
            targets: mem::take(&mut self.targets).into_iter(),
            weights: mem::take(&mut self.weights),
        }
    }
}

/// The frames taken out of a `ShuffleWindow`.
#[derive(Debug)]
pub struct Drain {
    dim: usize,
    cursor: usize,
    feats: Vec<f32>,
    targets: vec::IntoIter<Vec<(usize, f32)>>,
    weights: Vec<f32>,
}

impl Drain {
    /// The amount of frames not yet yielded.
    pub fn remaining(&self) -> usize {
        self.weights.len() - self.cursor
    }

    /// Takes the next block of at most `max_rows` consecutive frames.
    ///
    /// # Returns
    /// A `Batch`, or `None` once every frame was yielded.
    pub fn next_batch(&mut self, max_rows: NonZeroUsize) -> Option<Batch> {
        let rows = self.remaining().min(max_rows.get());
        if rows == 0 {
            return None;
        }

        let Self {
            dim,
            cursor: start,
            ref feats,
            ..
        } = *self;

        let batch = Batch {
            feats: Array2::from_shape_fn((rows, dim), |(r, c)| feats[(start + r) * dim + c]),
            targets: self.targets.by_ref().take(rows).collect(),
            weights: Array1::from(self.weights[start..start + rows].to_vec()),
        };

        self.cursor += rows;
        Some(batch)
    }
}

impl Iterator for Drain {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        let target = self.targets.next()?;
        let row = self.cursor;
        self.cursor += 1;

        Some(Frame {
            feats: self.feats[row * self.dim..(row + 1) * self.dim].to_vec(),
            target,
            weight: self.weights[row],
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Drain {}

/// Generates a uniformly random permutation of `0..len`, the mask for `ShuffleWindow::shuffle`.
pub fn random_permutation<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..len).collect();
    perm.shuffle(rng);
    perm
}

fn is_permutation(perm: &[usize], len: usize) -> bool {
    if perm.len() != len {
        return false;
    }

    let mut seen = vec![false; len];
    perm.iter()
        .all(|&row| row < len && !mem::replace(&mut seen[row], true))
}
