use std::{collections::HashMap, env, fs, process::ExitCode};

use anyhow::Context;
use log::{error, info};
use tokio::{signal, task};
use tokio_util::sync::CancellationToken;

use frmshuff_orchestra::{
    config::RunConfig,
    model::{Model, SoftmaxLinear},
    orchestra::Orchestrator,
    reader::{load_table_file, JsonlFeatureReader, SampleSource},
    sample::Posterior,
};

const SETUP_FAILED: u8 = 1;
const TRAINING_ABORTED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let (orchestrator, source) = match setup() {
        Ok(ret) => ret,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(SETUP_FAILED);
        }
    };

    let cancel = CancellationToken::new();
    let mut training = task::spawn_blocking({
        let cancel = cancel.clone();
        move || orchestrator.run(source, cancel)
    });

    let ret = tokio::select! {
        ret = &mut training => ret,
        _ = signal::ctrl_c() => {
            info!("received SIGINT, cancelling training");
            cancel.cancel();
            training.await
        }
    };

    match ret {
        Ok(Ok(outcome)) => {
            info!("{}", outcome.model.info());
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("{e}");
            ExitCode::from(TRAINING_ABORTED)
        }
        Err(e) => {
            error!("training task failed: {e}");
            ExitCode::from(TRAINING_ABORTED)
        }
    }
}

fn setup() -> anyhow::Result<(Orchestrator<SoftmaxLinear>, SampleSource)> {
    let path = env::args()
        .nth(1)
        .context("usage: frmshuff-train <config.json>")?;

    let json = fs::read_to_string(&path).with_context(|| format!("cannot read '{path}'"))?;
    let config = RunConfig::from_json(&json).with_context(|| format!("bad config '{path}'"))?;

    let features = JsonlFeatureReader::open(&config.features)
        .with_context(|| format!("cannot open '{}'", config.features.display()))?;

    let targets: HashMap<String, Posterior> = load_table_file(&config.targets)
        .with_context(|| format!("cannot load '{}'", config.targets.display()))?;
    info!("loaded {} target posteriors", targets.len());

    let mut source = SampleSource::new(features, targets);

    if let Some(path) = &config.frame_weights {
        let table: HashMap<String, Vec<f32>> = load_table_file(path)
            .with_context(|| format!("cannot load '{}'", path.display()))?;
        source = source.with_frame_weights(table);
    }

    if let Some(path) = &config.utt_weights {
        let table: HashMap<String, f32> = load_table_file(path)
            .with_context(|| format!("cannot load '{}'", path.display()))?;
        source = source.with_utt_weights(table);
    }

    let orchestrator = Orchestrator::new(config.training, config.model.build())?;
    Ok((orchestrator, source))
}
