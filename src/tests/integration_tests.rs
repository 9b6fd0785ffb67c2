use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::accelerator::LocalAccelerator;
use crate::config::ExperimentConfig;
use crate::engine::{Event, InMemorySource, RunOutcome};
use crate::error::Result;
use crate::experiment::Experiment;
use crate::hooks::{ARCHIVE_NAME, BEST_ITERATION_DIR};
use crate::metrics::Accuracy;
use crate::model::{Batch, Classifier, FEATURES_KEY, TARGET_KEY};
use crate::optim::Sgd;
use crate::trainer::{DataSources, MaxIters, Role, Trainer};

const FEATURES: usize = 4;

/// Points labelled by the sign of their first coordinate
fn separable_batches(seed: u64, batches: usize, batch_size: usize) -> Result<Vec<Batch>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let device = Device::Cpu;
    (0..batches)
        .map(|_| {
            let features: Vec<f32> = (0..batch_size * FEATURES)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect();
            let target: Vec<u32> = features
                .chunks(FEATURES)
                .map(|row| u32::from(row[0] > 0.0))
                .collect();
            let mut batch = Batch::new();
            batch.insert(
                FEATURES_KEY.to_string(),
                Tensor::from_vec(features, (batch_size, FEATURES), &device)?,
            );
            batch.insert(TARGET_KEY.to_string(), Tensor::new(target.as_slice(), &device)?);
            Ok(batch)
        })
        .collect()
}

fn classifier_trainer() -> Result<Trainer> {
    let classifier = Classifier::new(FEATURES, 2, &Device::Cpu)?;
    let sgd = Sgd::new(classifier.var_map(), 0.5, 0.0, 0.0)?;
    Ok(Trainer::new(
        Arc::new(RwLock::new(classifier)),
        Some(Arc::new(Mutex::new(sgd))),
        Arc::new(LocalAccelerator::cpu()),
    ))
}

#[test]
fn test_classifier_eval_loss_decreases() -> Result<()> {
    let trainer = classifier_trainer()?;
    let eval_losses = Arc::new(Mutex::new(Vec::new()));
    let sink = eval_losses.clone();
    trainer.add_event(Role::Eval, Event::Completed, move |ctx| {
        if let Some(loss) = ctx.state().metrics().get("loss") {
            sink.lock().push(loss);
        }
        Ok(())
    });
    let sources = DataSources::train(InMemorySource::shuffled(separable_batches(7, 16, 16)?, 7))
        .with_eval(InMemorySource::new(separable_batches(11, 4, 16)?));

    let report = trainer.run(sources, MaxIters::default(), 5)?;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let losses = eval_losses.lock().clone();
    assert_eq!(losses.len(), 6);
    assert!(
        losses[5] < losses[0],
        "eval loss did not decrease: {:?}",
        losses
    );
    Ok(())
}

#[test]
fn test_experiment_run_writes_artifacts() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("exp");
    let config = ExperimentConfig::from_yaml_str(&format!(
        r#"
name: integration
dir: {}
epochs: 2
debug:
  enabled: true
  num_iters: 2
checkpoint_total_limit: 1
progress:
  enabled: false
tracking:
  jsonl: {}
"#,
        dir.display(),
        tmp.path().join("metrics.jsonl").display()
    ))?;

    let classifier = Classifier::new(FEATURES, 2, &Device::Cpu)?;
    let sgd = Sgd::new(classifier.var_map(), 0.1, 0.9, 0.0)?;
    let mut experiment = Experiment::new(config)?.with_metric("accuracy", Accuracy::shared);
    let sources = DataSources::train(InMemorySource::new(separable_batches(1, 5, 8)?))
        .with_eval(InMemorySource::new(separable_batches(2, 5, 8)?));

    let report = experiment.run(
        Arc::new(RwLock::new(classifier)),
        Some(Arc::new(Mutex::new(sgd))),
        sources,
    )?;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.state.name(), "eval");
    assert_eq!(report.state.epoch_iteration(), 2);
    assert!(report.state.metrics().get("loss").is_some());
    assert!(report.state.metrics().get("accuracy").is_some());

    assert!(dir.join(ARCHIVE_NAME).is_file());
    assert!(dir.join(BEST_ITERATION_DIR).join("checkpoint.json").is_file());
    assert_eq!(std::fs::read_dir(dir.join("checkpoints"))?.count(), 1);

    let lines = std::fs::read_to_string(tmp.path().join("metrics.jsonl"))?;
    assert!(lines.lines().count() > 1);
    assert!(lines.contains("loss_epoch/train"));
    assert!(lines.contains("accuracy_epoch/eval"));
    Ok(())
}

#[test]
fn test_experiment_without_dir_skips_checkpoints() -> Result<()> {
    let config = ExperimentConfig {
        epochs: 1,
        max_iters: MaxIters {
            train: Some(2),
            eval: Some(1),
        },
        ..ExperimentConfig::default()
    };
    let mut experiment = Experiment::new(config)?;
    let classifier = Classifier::new(FEATURES, 2, &Device::Cpu)?;
    let sgd = Sgd::new(classifier.var_map(), 0.1, 0.0, 0.0)?;
    let trainer = experiment.build_trainer(
        Arc::new(RwLock::new(classifier)),
        Some(Arc::new(Mutex::new(sgd))),
    )?;

    assert!(trainer.accelerator().project_dir().is_none());
    assert!(experiment.interrupt_handle().is_some());

    let sources = DataSources::train(InMemorySource::new(separable_batches(3, 4, 4)?))
        .with_eval(InMemorySource::new(separable_batches(4, 4, 4)?));
    let report = trainer.run(sources, experiment.config().max_iters, experiment.config().epochs)?;
    assert_eq!(trainer.state(Role::Train).epoch_iteration(), 2);
    assert_eq!(report.state.epoch_iteration(), 1);
    Ok(())
}
