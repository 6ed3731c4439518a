use crate::{
    model::{ModelError, StepStats},
    orchestra::Batch,
};

/// A worker's handle to the shared model.
///
/// A `Synchronizer` decides how minibatches coming from concurrent workers get applied
/// to the model, each worker owns exactly one.
pub trait Synchronizer: Send {
    /// Applies one minibatch to the model.
    ///
    /// # Arguments
    /// * `batch` - The minibatch to apply.
    /// * `eval` - Only evaluate the objective, leave the parameters untouched.
    ///
    /// # Returns
    /// The step statistics, or the `ModelError` raised by the model.
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError>;

    /// Called by the worker after it finished processing a whole window.
    fn window_done(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Called once by a worker that stopped after consuming all of its input.
    fn leave(&mut self) {}

    /// A human-readable report of the model's state.
    fn info(&self) -> String;
}
