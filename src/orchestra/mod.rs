mod error;
mod orchestrator;
mod producer;
mod repository;
mod window;
mod worker;

pub use error::{Result, TrainError};
pub use orchestrator::Orchestrator;
pub use producer::Producer;
pub use repository::{ClosedQueueError, ExampleRepository};
pub use window::{random_permutation, Batch, Drain, Frame, ShuffleWindow, WindowError};
pub use worker::{Worker, WorkerSettings, WorkerState};
