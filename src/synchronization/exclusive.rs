use std::sync::Arc;

use parking_lot::Mutex;

use super::Synchronizer;
use crate::{
    model::{Model, ModelError, StepStats},
    orchestra::Batch,
};

/// Serializes every update step on a single model behind a lock.
///
/// Workers still fill and shuffle their windows concurrently, only the model step is
/// exclusive.
pub struct ExclusiveSync<M> {
    model: Arc<Mutex<M>>,
}

impl<M> ExclusiveSync<M> {
    /// Creates a new `ExclusiveSync` synchronizer.
    ///
    /// # Arguments
    /// * `model` - The model shared by every worker.
    ///
    /// # Returns
    /// A new `ExclusiveSync` instance.
    pub fn new(model: Arc<Mutex<M>>) -> Self {
        Self { model }
    }
}

impl<M> Clone for ExclusiveSync<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
        }
    }
}

impl<M: Model> Synchronizer for ExclusiveSync<M> {
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError> {
        self.model.lock().step(batch, eval)
    }

    fn info(&self) -> String {
        self.model.lock().info()
    }
}
