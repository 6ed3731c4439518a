use std::{
    collections::HashMap,
    io,
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::Duration,
};

use ndarray::Array2;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use frmshuff_orchestra::{
    config::TrainConfig,
    model::{Model, ModelError, Objective, SoftmaxLinear, StepStats},
    orchestra::{Batch, Orchestrator, TrainError},
    reader::{ReaderError, SampleSource},
    sample::Posterior,
    synchronization::UpdateDiscipline,
};

/// Records the id carried in the first feature column of every frame it sees.
#[derive(Debug, Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<usize>>>,
    params: Vec<f32>,
    fail_after: Option<usize>,
    panic: bool,
}

impl Model for Recorder {
    fn step(&mut self, batch: &Batch, _eval: bool) -> Result<StepStats, ModelError> {
        if self.panic {
            panic!("recorder asked to panic");
        }

        let mut seen = self.seen.lock();
        if self.fail_after.is_some_and(|limit| seen.len() >= limit) {
            return Err(ModelError::NonFinite("objective"));
        }

        seen.extend(batch.feats.column(0).iter().map(|&id| id as usize));
        Ok(StepStats::new(batch.len(), batch.len() as f64))
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }
}

type FeatureItem = Result<(String, Array2<f32>), ReaderError>;

/// `utterances` utterances of `frames` frames each, every frame tagged with a global id.
fn corpus(utterances: usize, frames: usize) -> (Vec<FeatureItem>, HashMap<String, Posterior>) {
    let feats = (0..utterances)
        .map(|u| {
            let m = Array2::from_shape_fn((frames, 2), |(r, _)| (u * frames + r) as f32);
            Ok((format!("utt-{u}"), m))
        })
        .collect();

    let targets = (0..utterances)
        .map(|u| (format!("utt-{u}"), vec![vec![(0, 1.)]; frames]))
        .collect();

    (feats, targets)
}

fn config(workers: usize, capacity: usize, window: usize, minibatch: usize) -> TrainConfig {
    TrainConfig {
        num_workers: NonZeroUsize::new(workers).unwrap(),
        queue_capacity: NonZeroUsize::new(capacity),
        window_frames: NonZeroUsize::new(window).unwrap(),
        minibatch_size: NonZeroUsize::new(minibatch).unwrap(),
        progress_utterances: 0,
        progress_frames: 0,
        ..TrainConfig::default()
    }
}

#[test]
fn every_frame_is_trained_on_exactly_once() {
    let (feats, targets) = corpus(50, 3);
    let source = SampleSource::new(feats.into_iter(), targets);
    let recorder = Recorder::default();
    let seen = Arc::clone(&recorder.seen);

    let orchestrator = Orchestrator::new(config(4, 2, 8, 4), recorder).unwrap();
    let outcome = orchestrator.run(source, CancellationToken::new()).unwrap();

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..150).collect::<Vec<_>>());

    let summary = outcome.summary;
    assert_eq!(summary.producer.read, 50);
    assert_eq!(summary.producer.submitted, 50);
    assert_eq!(summary.processed_samples(), 50);
    assert_eq!(summary.processed_frames(), 150);
    assert_eq!(summary.workers.len(), 4);
    assert!(!summary.has_skips());
}

#[test]
fn skipped_utterances_are_reported_but_do_not_fail_the_run() {
    let (feats, mut targets) = corpus(10, 2);
    targets.remove("utt-3");
    targets.remove("utt-7");

    let source = SampleSource::new(feats.into_iter(), targets);
    let orchestrator = Orchestrator::new(config(2, 2, 4, 2), Recorder::default()).unwrap();
    let outcome = orchestrator.run(source, CancellationToken::new()).unwrap();

    assert_eq!(outcome.summary.producer.missing_targets, 2);
    assert_eq!(outcome.summary.processed_samples(), 8);
    assert!(outcome.summary.has_skips());
}

#[test]
fn a_failing_model_aborts_the_run_without_deadlocking() {
    let (feats, targets) = corpus(500, 4);
    let source = SampleSource::new(feats.into_iter(), targets);
    let recorder = Recorder {
        fail_after: Some(40),
        ..Recorder::default()
    };

    let orchestrator = Orchestrator::new(config(3, 1, 8, 4), recorder).unwrap();
    let err = orchestrator.run(source, CancellationToken::new()).unwrap_err();

    assert!(matches!(err, TrainError::Model { .. }), "got {err}");
}

#[test]
fn a_reader_failure_aborts_the_run() {
    let (mut feats, targets) = corpus(20, 2);
    feats.insert(10, Err(ReaderError::Io(io::Error::other("disk on fire"))));

    let source = SampleSource::new(feats.into_iter(), targets);
    let orchestrator = Orchestrator::new(config(2, 2, 4, 2), Recorder::default()).unwrap();
    let err = orchestrator.run(source, CancellationToken::new()).unwrap_err();

    assert!(matches!(err, TrainError::Reader(_)), "got {err}");
}

#[test]
fn a_panicking_worker_is_reported() {
    let (feats, targets) = corpus(20, 2);
    let source = SampleSource::new(feats.into_iter(), targets);
    let recorder = Recorder {
        panic: true,
        ..Recorder::default()
    };

    let orchestrator = Orchestrator::new(config(2, 1, 4, 2), recorder).unwrap();
    let err = orchestrator.run(source, CancellationToken::new()).unwrap_err();

    assert!(matches!(err, TrainError::WorkerPanicked { .. }), "got {err}");
}

#[test]
fn cancellation_stops_an_endless_source() {
    let feats = std::iter::repeat_with(|| Ok(("utt".to_string(), Array2::zeros((2, 2)))));
    let targets = HashMap::from([("utt".to_string(), vec![vec![(0, 1.)]; 2])]);
    let source = SampleSource::new(feats, targets);

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };

    let orchestrator = Orchestrator::new(config(2, 2, 16, 4), Recorder::default()).unwrap();
    let err = orchestrator.run(source, cancel).unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, TrainError::Cancelled), "got {err}");
}

#[test]
fn eight_workers_share_a_single_slot_queue() {
    let (feats, targets) = corpus(10_000, 1);
    let source = SampleSource::new(feats.into_iter(), targets);
    let recorder = Recorder::default();
    let seen = Arc::clone(&recorder.seen);

    let orchestrator = Orchestrator::new(config(8, 1, 4, 2), recorder).unwrap();
    let outcome = orchestrator.run(source, CancellationToken::new()).unwrap();

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..10_000).collect::<Vec<_>>());

    let summary = outcome.summary;
    assert_eq!(summary.producer.frames_submitted, 10_000);
    assert_eq!(summary.processed_frames(), summary.producer.frames_submitted);
    assert_eq!(summary.workers.len(), 8);
}

#[test]
fn a_wrong_width_utterance_is_skipped_wherever_it_arrives() {
    let utterance = |key: &str, dim: usize| -> FeatureItem {
        Ok((key.to_string(), Array2::zeros((2, dim))))
    };
    let targets: HashMap<_, _> = ["a", "wide", "b"]
        .into_iter()
        .map(|key| (key.to_string(), vec![vec![(0, 1.)]; 2]))
        .collect();

    for order in [["wide", "a", "b"], ["a", "wide", "b"], ["a", "b", "wide"]] {
        let feats: Vec<FeatureItem> = order
            .into_iter()
            .map(|key| utterance(key, if key == "wide" { 3 } else { 2 }))
            .collect();
        let source = SampleSource::new(feats.into_iter(), targets.clone());

        let model = SoftmaxLinear::new(2, 2, 0.1, Objective::Xent);
        let outcome = Orchestrator::new(config(1, 1, 16, 4), model)
            .unwrap()
            .run(source, CancellationToken::new())
            .unwrap();

        let summary = outcome.summary;
        assert_eq!(summary.producer.rejected, 1, "order {order:?}");
        assert_eq!(summary.rejected_by_workers(), 0, "order {order:?}");
        assert_eq!(summary.processed_samples(), 2, "order {order:?}");
        assert_eq!(outcome.model.frames(), 4, "order {order:?}");
    }
}

fn separable(utterances: usize) -> (Vec<FeatureItem>, HashMap<String, Posterior>) {
    let feats = (0..utterances)
        .map(|u| {
            let class = u % 2;
            let m = Array2::from_shape_fn((4, 2), |(_, c)| if c == class { 1. } else { 0. });
            Ok((format!("utt-{u}"), m))
        })
        .collect();

    let targets = (0..utterances)
        .map(|u| (format!("utt-{u}"), vec![vec![(u % 2, 1.)]; 4]))
        .collect();

    (feats, targets)
}

#[test]
fn replicate_and_merge_trains_the_reference_model() {
    let (feats, targets) = separable(64);
    let source = SampleSource::new(feats.into_iter(), targets);

    let config = TrainConfig {
        discipline: UpdateDiscipline::ReplicateAndMerge {
            merge_every: NonZeroUsize::MIN,
        },
        ..config(3, 3, 16, 8)
    };

    let model = SoftmaxLinear::new(2, 2, 0.5, Objective::Xent);
    let outcome = Orchestrator::new(config, model)
        .unwrap()
        .run(source, CancellationToken::new())
        .unwrap();

    let params = outcome.model.params();
    // class 0 weight on feature 0 grows, class 1 weight on feature 0 shrinks
    assert!(params[0] > 0.);
    assert!(params[2] < 0.);
    assert_eq!(outcome.summary.processed_frames(), 256);
}

#[test]
fn crossvalidation_leaves_the_model_untouched() {
    let (feats, targets) = separable(16);
    let source = SampleSource::new(feats.into_iter(), targets);

    let config = TrainConfig {
        crossvalidate: true,
        ..config(2, 2, 16, 8)
    };

    let model = SoftmaxLinear::new(2, 2, 0.5, Objective::Xent);
    let outcome = Orchestrator::new(config, model)
        .unwrap()
        .run(source, CancellationToken::new())
        .unwrap();

    assert!(outcome.model.params().iter().all(|&p| p == 0.));
    assert_eq!(outcome.model.frames(), 64);
    assert!((outcome.summary.avg_objective() - 2f64.ln()).abs() < 1e-5);
}

#[test]
fn workers_without_input_do_not_dilute_the_merged_model() {
    let train = |workers: usize| {
        let (feats, targets) = separable(1);
        let source = SampleSource::new(feats.into_iter(), targets);
        let config = TrainConfig {
            discipline: UpdateDiscipline::ReplicateAndMerge {
                merge_every: NonZeroUsize::new(100).unwrap(),
            },
            randomize: false,
            ..config(workers, workers, 16, 8)
        };

        let model = SoftmaxLinear::new(2, 2, 0.5, Objective::Xent);
        Orchestrator::new(config, model)
            .unwrap()
            .run(source, CancellationToken::new())
            .unwrap()
            .model
    };

    let alone = train(1);
    assert!(alone.params()[0] > 0.);

    for workers in [4, 8] {
        let pooled = train(workers);
        for (a, b) in alone.params().iter().zip(pooled.params()) {
            assert!((a - b).abs() < 1e-6, "{workers} workers: {a} vs {b}");
        }
    }
}
