mod exclusive;
mod replicated;
mod synchronizer;

use std::{num::NonZeroUsize, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use exclusive::ExclusiveSync;
pub use replicated::{ReplicaMerger, ReplicaSync};
pub use synchronizer::Synchronizer;

use crate::model::Model;

/// How concurrent workers mutate the model, fixed at configuration time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDiscipline {
    /// A single model behind a lock, every update step is serialized.
    #[default]
    Exclusive,
    /// One replica per worker, averaged every `merge_every` windows.
    ReplicateAndMerge { merge_every: NonZeroUsize },
}

/// The model state shared by the worker pool under a given `UpdateDiscipline`.
pub enum SharedModel<M> {
    Exclusive(Arc<Mutex<M>>),
    Replicated {
        base: M,
        merger: Arc<ReplicaMerger>,
        merge_every: NonZeroUsize,
    },
}

impl<M: Model + Clone + 'static> SharedModel<M> {
    /// Wraps `model` for sharing.
    ///
    /// # Arguments
    /// * `model` - The initial model.
    /// * `discipline` - How the workers will update it.
    ///
    /// # Returns
    /// A new `SharedModel` instance.
    pub fn new(model: M, discipline: UpdateDiscipline) -> Self {
        match discipline {
            UpdateDiscipline::Exclusive => Self::Exclusive(Arc::new(Mutex::new(model))),
            UpdateDiscipline::ReplicateAndMerge { merge_every } => Self::Replicated {
                merger: Arc::new(ReplicaMerger::new(model.params().len())),
                base: model,
                merge_every,
            },
        }
    }

    /// Creates the handle for one more worker.
    ///
    /// Under replicate-and-merge every handle joins the merge group, so all of them
    /// must be created before any worker starts running.
    pub fn synchronizer(&self) -> Box<dyn Synchronizer> {
        match self {
            Self::Exclusive(model) => Box::new(ExclusiveSync::new(Arc::clone(model))),
            Self::Replicated {
                base,
                merger,
                merge_every,
            } => Box::new(ReplicaSync::new(
                base.clone(),
                Arc::clone(merger),
                *merge_every,
            )),
        }
    }

    /// Recovers the trained model once every worker is done.
    ///
    /// Under replicate-and-merge this is the initial model carrying the merged parameters,
    /// or left untouched if no replica ever trained.
    pub fn into_model(self) -> M {
        match self {
            Self::Exclusive(model) => match Arc::try_unwrap(model) {
                Ok(model) => model.into_inner(),
                Err(model) => model.lock().clone(),
            },
            Self::Replicated {
                mut base, merger, ..
            } => {
                if let Some(params) = merger.final_params() {
                    let dst = base.params_mut();
                    if dst.len() == params.len() {
                        dst.copy_from_slice(&params);
                    }
                }

                base
            }
        }
    }
}
