use std::{error::Error, fmt, io};

use super::ClosedQueueError;
use crate::{model::ModelError, reader::ReaderError};

/// The orchestra module's result type.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Failures that abort a training run.
///
/// Per-sample problems never show up here, they are skipped and counted in the summary.
#[derive(Debug)]
pub enum TrainError {
    InvalidConfig(String),
    Reader(ReaderError),
    Protocol(&'static str),
    Model {
        worker_id: usize,
        source: ModelError,
    },
    WorkerPanicked {
        worker_id: usize,
    },
    Cancelled,
    Io(io::Error),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            TrainError::Reader(e) => write!(f, "reader error: {e}"),
            TrainError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            TrainError::Model { worker_id, source } => {
                write!(f, "model error in worker {worker_id}: {source}")
            }
            TrainError::WorkerPanicked { worker_id } => write!(f, "worker {worker_id} panicked"),
            TrainError::Cancelled => f.write_str("training cancelled"),
            TrainError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainError::Reader(e) => Some(e),
            TrainError::Model { source, .. } => Some(source),
            TrainError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ReaderError> for TrainError {
    fn from(value: ReaderError) -> Self {
        Self::Reader(value)
    }
}

impl From<io::Error> for TrainError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ClosedQueueError> for TrainError {
    fn from(_: ClosedQueueError) -> Self {
        Self::Protocol("the example repository was already closed")
    }
}
