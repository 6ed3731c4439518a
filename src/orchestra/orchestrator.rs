use std::{sync::Arc, thread::JoinHandle, time::Instant};

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use super::{
    error::{Result, TrainError},
    producer::Producer,
    worker::{Worker, WorkerSettings},
    ExampleRepository,
};
use crate::{
    config::TrainConfig,
    metrics::{Summary, TrainOutcome, WorkerMetrics},
    model::Model,
    reader::SampleSource,
    synchronization::SharedModel,
};

/// Drives a whole training run.
///
/// The orchestrator owns the example repository, spawns the worker pool, reads the
/// inputs on the calling thread and closes the repository once they run out. It never
/// touches the model math, that's the workers' business.
pub struct Orchestrator<M> {
    config: TrainConfig,
    model: M,
}

impl<M: Model + Clone + 'static> Orchestrator<M> {
    /// Creates a new `Orchestrator`.
    ///
    /// # Arguments
    /// * `config` - The run configuration.
    /// * `model` - The initial model.
    ///
    /// # Returns
    /// A new `Orchestrator` or a `TrainError::InvalidConfig`.
    pub fn new(config: TrainConfig, model: M) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Runs the producer on the calling thread until `source` is exhausted and waits for
    /// the workers to drain the repository.
    ///
    /// # Arguments
    /// * `source` - The training inputs.
    /// * `cancel` - Cancelling it stops every thread at its next check.
    ///
    /// # Returns
    /// The trained model along with the run's summary.
    ///
    /// # Errors
    /// The first fatal failure: a worker's model or panic before a reader error, and any of
    /// them before a plain cancellation.
    pub fn run(
        self,
        mut source: SampleSource,
        cancel: CancellationToken,
    ) -> Result<TrainOutcome<M>> {
        let started = Instant::now();
        let Self { config, model } = self;
        let feature_dim = model.feature_dim();

        let repository = Arc::new(ExampleRepository::new(config.queue_capacity()));
        let shared = SharedModel::new(model, config.discipline);
        let settings = WorkerSettings::from(&config);

        info!(
            "starting {} workers, queue capacity {}, window {} frames, minibatch {}, {:?}{}",
            config.num_workers,
            repository.capacity(),
            config.window_frames,
            config.minibatch_size,
            config.discipline,
            if config.crossvalidate { ", crossvalidation" } else { "" },
        );

        // every synchronizer must exist before the first worker starts merging
        let workers: Vec<_> = (0..config.num_workers.get())
            .map(|worker_id| {
                Worker::new(
                    worker_id,
                    Arc::clone(&repository),
                    shared.synchronizer(),
                    settings.clone(),
                    cancel.clone(),
                )
            })
            .collect();

        let mut failure = None;
        let mut handles = Vec::with_capacity(workers.len());

        for worker in workers {
            let worker_id = worker.id();
            match worker.spawn() {
                Ok(handle) => handles.push((worker_id, handle)),
                Err(e) => {
                    error!(worker_id = worker_id; "couldn't spawn worker: {e}");
                    failure = Some(TrainError::Io(e));
                    break;
                }
            }
        }

        let mut producer = Producer::new(&config).with_feature_dim(feature_dim);
        if failure.is_none() {
            let produced = producer
                .run(&repository, &mut source, &cancel)
                .and_then(|()| close(&repository, &cancel));

            if let Err(e) = produced {
                failure = Some(e);
            }
        }

        if let Some(e) = &failure {
            if !matches!(e, TrainError::Cancelled) {
                error!("producer failed: {e}");
            }

            cancel.cancel();
            let discarded = repository.abort();
            if discarded > 0 {
                warn!("discarded {discarded} pending samples");
            }
        }

        let (workers, worker_failure) = join(handles);
        let summary = Summary {
            producer: producer.into_stats(),
            workers,
            elapsed: started.elapsed(),
        };

        if let Some(e) = pick(worker_failure, failure) {
            error!("training aborted: {e}; {summary}");
            return Err(e);
        }

        if summary.has_skips() {
            warn!("training done with skipped utterances: {summary}");
        } else {
            info!("training done: {summary}");
        }

        Ok(TrainOutcome {
            model: shared.into_model(),
            summary,
        })
    }
}

fn close<T>(repository: &ExampleRepository<T>, cancel: &CancellationToken) -> Result<()> {
    match repository.close() {
        Ok(()) => Ok(()),
        Err(_) if cancel.is_cancelled() => Err(TrainError::Cancelled),
        Err(e) => Err(e.into()),
    }
}

/// Waits for every worker, collecting the metrics of the ones that finished.
fn join(
    handles: Vec<(usize, JoinHandle<Result<WorkerMetrics>>)>,
) -> (Vec<WorkerMetrics>, Option<TrainError>) {
    let mut metrics = Vec::with_capacity(handles.len());
    let mut failure = None;

    for (worker_id, handle) in handles {
        match handle.join() {
            Ok(Ok(m)) => metrics.push(m),
            Ok(Err(e)) => failure = pick(failure, Some(e)),
            Err(_) => {
                error!(worker_id = worker_id; "worker panicked");
                failure = pick(failure, Some(TrainError::WorkerPanicked { worker_id }));
            }
        }
    }

    (metrics, failure)
}

/// Keeps the first failure unless it's a cancellation and the other one explains it.
fn pick(first: Option<TrainError>, other: Option<TrainError>) -> Option<TrainError> {
    match (first, other) {
        (Some(TrainError::Cancelled), Some(other)) => Some(other),
        (Some(first), _) => Some(first),
        (None, other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;

    #[test]
    fn test_pick_prefers_the_root_cause() {
        let model_err = || TrainError::Model {
            worker_id: 1,
            source: ModelError::NonFinite("objective"),
        };

        assert!(matches!(
            pick(Some(TrainError::Cancelled), Some(model_err())),
            Some(TrainError::Model { worker_id: 1, .. })
        ));
        assert!(matches!(
            pick(Some(model_err()), Some(TrainError::Cancelled)),
            Some(TrainError::Model { .. })
        ));
        assert!(matches!(
            pick(None, Some(TrainError::Cancelled)),
            Some(TrainError::Cancelled)
        ));
        assert!(pick(None, None).is_none());
    }

    #[test]
    fn test_close_twice_is_a_protocol_violation() {
        let repository = ExampleRepository::<u8>::new(std::num::NonZeroUsize::MIN);
        let cancel = CancellationToken::new();

        assert!(close(&repository, &cancel).is_ok());
        assert!(matches!(
            close(&repository, &cancel),
            Err(TrainError::Protocol(_))
        ));

        cancel.cancel();
        assert!(matches!(
            close(&repository, &cancel),
            Err(TrainError::Cancelled)
        ));
    }
}
