use std::{num::NonZeroUsize, sync::Arc};

use log::debug;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use super::Synchronizer;
use crate::{
    model::{Model, ModelError, StepStats},
    orchestra::Batch,
};

#[derive(Debug)]
struct Round {
    active: usize,
    arrived: usize,
    generation: u64,
    sum: Vec<f32>,
    average: Vec<f32>,
    retired_frames: u64,
    retired_sum: Vec<f32>,
}

impl Round {
    fn finish(&mut self) {
        let n = self.arrived as f32;
        let Round { sum, average, .. } = self;

        average
            .par_iter_mut()
            .zip(sum.par_iter_mut())
            .for_each(|(avg, acc)| {
                *avg = *acc / n;
                *acc = 0.;
            });

        self.arrived = 0;
        self.generation += 1;
    }
}

/// Averages the parameters of every worker's replica under a rendezvous.
///
/// The group is dynamic: workers `join` it before starting and `leave` it once they
/// stop, a round completes as soon as every worker still in the group has arrived.
/// This way a worker that ran out of input never leaves its peers waiting.
#[derive(Debug)]
pub struct ReplicaMerger {
    nparams: usize,
    round: Mutex<Round>,
    merged: Condvar,
}

impl ReplicaMerger {
    /// Creates a new empty `ReplicaMerger`.
    ///
    /// # Arguments
    /// * `nparams` - The size of the flat parameter buffers being merged.
    pub fn new(nparams: usize) -> Self {
        Self {
            nparams,
            round: Mutex::new(Round {
                active: 0,
                arrived: 0,
                generation: 0,
                sum: vec![0.; nparams],
                average: vec![0.; nparams],
                retired_frames: 0,
                retired_sum: vec![0.; nparams],
            }),
            merged: Condvar::new(),
        }
    }

    /// Adds a member to the group, must be called before any member starts merging.
    pub fn join(&self) {
        self.round.lock().active += 1;
    }

    /// Waits for every active member to arrive and overwrites `params` with the average.
    ///
    /// # Arguments
    /// * `params` - The caller's replica parameters.
    ///
    /// # Returns
    /// A `ModelError::ShapeMismatch` if `params` has the wrong size.
    pub fn merge(&self, params: &mut [f32]) -> Result<(), ModelError> {
        self.check_size(params)?;

        let mut round = self.round.lock();
        round
            .sum
            .par_iter_mut()
            .zip(params.par_iter())
            .for_each(|(acc, p)| *acc += p);
        round.arrived += 1;

        let generation = round.generation;
        if round.arrived >= round.active {
            debug!(generation = generation; "merging {} replicas", round.arrived);
            round.finish();
            self.merged.notify_all();
        } else {
            while round.generation == generation {
                self.merged.wait(&mut round);
            }
        }

        params.copy_from_slice(&round.average);
        Ok(())
    }

    /// Removes a member from the group, releasing its peers if they were only waiting on it.
    ///
    /// # Arguments
    /// * `params` - The member's final replica, `None` if it has nothing valid to contribute.
    /// * `frames` - The frames the replica trained on since its last merge. A replica that
    ///   didn't train since then adds nothing its peers don't already carry, so it's left
    ///   out of the final average.
    pub fn leave(&self, params: Option<&[f32]>, frames: u64) {
        let mut round = self.round.lock();
        round.active = round.active.saturating_sub(1);

        let params = params.filter(|p| frames > 0 && p.len() == self.nparams);
        if let Some(params) = params {
            let weight = frames as f32;
            round
                .retired_sum
                .iter_mut()
                .zip(params)
                .for_each(|(acc, p)| *acc += weight * p);
            round.retired_frames += frames;
        }

        if round.arrived > 0 && round.arrived >= round.active {
            round.finish();
            self.merged.notify_all();
        }
    }

    /// The final parameters of the group.
    ///
    /// That's the average of the replicas that trained after their last merge, weighted by
    /// the frames each of them trained on. If none did, it's the last merged average.
    ///
    /// # Returns
    /// `None` if no replica ever trained nor merged.
    pub fn final_params(&self) -> Option<Vec<f32>> {
        let round = self.round.lock();

        if round.retired_frames == 0 {
            return (round.generation > 0).then(|| round.average.clone());
        }

        let n = round.retired_frames as f32;
        Some(round.retired_sum.iter().map(|acc| acc / n).collect())
    }

    fn check_size(&self, params: &[f32]) -> Result<(), ModelError> {
        if params.len() != self.nparams {
            return Err(ModelError::ShapeMismatch {
                what: "replica parameters",
                got: params.len(),
                expected: self.nparams,
            });
        }

        Ok(())
    }
}

/// Trains a private replica of the model and periodically averages it with its peers.
pub struct ReplicaSync<M> {
    replica: M,
    merger: Arc<ReplicaMerger>,
    merge_every: NonZeroUsize,
    windows: usize,
    unmerged_frames: u64,
    left: bool,
}

impl<M> ReplicaSync<M> {
    /// Creates a new `ReplicaSync` synchronizer and joins the merge group.
    ///
    /// # Arguments
    /// * `replica` - This worker's copy of the model.
    /// * `merger` - The rendezvous shared by every replica.
    /// * `merge_every` - The amount of windows to process between merges.
    ///
    /// # Returns
    /// A new `ReplicaSync` instance.
    pub fn new(replica: M, merger: Arc<ReplicaMerger>, merge_every: NonZeroUsize) -> Self {
        merger.join();

        Self {
            replica,
            merger,
            merge_every,
            windows: 0,
            unmerged_frames: 0,
            left: false,
        }
    }
}

impl<M: Model> Synchronizer for ReplicaSync<M> {
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError> {
        let stats = self.replica.step(batch, eval)?;
        if !eval {
            self.unmerged_frames += stats.frames() as u64;
        }

        Ok(stats)
    }

    fn window_done(&mut self) -> Result<(), ModelError> {
        self.windows += 1;

        if self.windows % self.merge_every.get() == 0 {
            self.merger.merge(self.replica.params_mut())?;
            self.unmerged_frames = 0;
        }

        Ok(())
    }

    fn leave(&mut self) {
        if !self.left {
            self.left = true;
            self.merger.leave(Some(self.replica.params()), self.unmerged_frames);
        }
    }

    fn info(&self) -> String {
        self.replica.info()
    }
}

impl<M> Drop for ReplicaSync<M> {
    fn drop(&mut self) {
        if !self.left {
            self.merger.leave(None, 0);
        }
    }
}
