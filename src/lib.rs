//! A frame-shuffling parallel trainer.
//!
//! A single producer streams utterances into a bounded `ExampleRepository`, a pool of
//! worker threads pulls them into per-worker `ShuffleWindow`s, shuffles the frames and
//! feeds them in minibatches to a shared `Model`.

pub mod config;
pub mod metrics;
pub mod model;
pub mod orchestra;
pub mod reader;
pub mod sample;
pub mod synchronization;

pub use config::{ModelConfig, RunConfig, TrainConfig};
pub use metrics::{Summary, TrainOutcome};
pub use model::{Model, ModelError, StepStats};
pub use orchestra::{Orchestrator, Result, TrainError};
pub use reader::SampleSource;
pub use sample::{Posterior, Sample};
pub use synchronization::UpdateDiscipline;
