use std::fs;

use super::fixtures::*;
use crate::accelerator::{Checkpointable, LocalAccelerator};
use crate::error::{Error, Result};
use crate::hooks::{attach_checkpointer, attach_metrics, MetricFactory, BEST_ITERATION_DIR};
use crate::metrics::{Accuracy, Metric, SharedMetric};
use crate::trainer::{DataSources, MaxIters, Role};

#[test]
fn test_run_state_restores_into_fresh_trainer() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(tmp.path()));
    attach_checkpointer(&fixture.trainer, Vec::new())?;
    let sources = DataSources::train(loss_source(&[1.0, 2.0, 3.0])?)
        .with_eval(loss_source(&[4.0, 6.0])?);
    fixture.trainer.run(sources, MaxIters::default(), 2)?;

    let other_dir = tempfile::tempdir()?;
    let fresh = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(other_dir.path()));
    attach_checkpointer(&fresh.trainer, Vec::new())?;
    fresh
        .trainer
        .accelerator()
        .load_state(&tmp.path().join(BEST_ITERATION_DIR))?;

    for role in Role::ALL {
        assert_eq!(
            fresh.trainer.state(role).snapshot(),
            fixture.trainer.state(role).snapshot()
        );
    }
    let train = fresh.trainer.state(Role::Train);
    assert_eq!(train.epoch(), 2);
    assert_eq!(train.iteration(), 6);
    assert_eq!(train.metrics().get("loss"), Some(2.0));
    assert_eq!(fresh.trainer.state(Role::Eval).metrics().get("loss"), Some(5.0));
    assert_eq!(fresh.optimizer.lock().steps, 6);
    Ok(())
}

#[test]
fn test_metric_state_is_checkpointed() -> Result<()> {
    let factories = || {
        let make: MetricFactory = Box::new(|| -> SharedMetric { Accuracy::shared() });
        std::collections::BTreeMap::from([("accuracy".to_string(), make)])
    };
    let batches = || -> Result<Vec<_>> {
        Ok(vec![classification_batch(&[[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]], &[0, 1, 1])?])
    };

    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(tmp.path()));
    let metrics = attach_metrics(&fixture.trainer, &factories());
    attach_checkpointer(
        &fixture.trainer,
        metrics
            .iter()
            .map(|metric| Box::new(metric.clone()) as Box<dyn Checkpointable>)
            .collect(),
    )?;
    fixture
        .trainer
        .evaluate(&mut crate::engine::InMemorySource::new(batches()?), None)?;

    let fresh = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(tmp.path()));
    let restored = attach_metrics(&fresh.trainer, &factories());
    attach_checkpointer(
        &fresh.trainer,
        restored
            .iter()
            .map(|metric| Box::new(metric.clone()) as Box<dyn Checkpointable>)
            .collect(),
    )?;
    fresh
        .trainer
        .accelerator()
        .load_state(&tmp.path().join(BEST_ITERATION_DIR))?;

    let eval_accuracy = restored[1].lock().compute()?;
    assert_eq!(eval_accuracy, Some(2.0 / 3.0));
    assert_eq!(restored[0].lock().compute()?, None);
    Ok(())
}

#[test]
fn test_load_rejects_different_registration() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(tmp.path()));
    attach_checkpointer(&fixture.trainer, Vec::new())?;
    fixture.trainer.evaluate(&mut constant_loss_source(1, 1.0)?, None)?;

    let fresh = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(tmp.path()));
    let metrics = attach_metrics(&fresh.trainer, &{
        let make: MetricFactory = Box::new(|| -> SharedMetric { Accuracy::shared() });
        std::collections::BTreeMap::from([("accuracy".to_string(), make)])
    });
    attach_checkpointer(
        &fresh.trainer,
        metrics
            .into_iter()
            .map(|metric| Box::new(metric) as Box<dyn Checkpointable>)
            .collect(),
    )?;

    let result = fresh
        .trainer
        .accelerator()
        .load_state(&tmp.path().join(BEST_ITERATION_DIR));
    assert!(matches!(result, Err(Error::Checkpoint(_))));
    Ok(())
}

#[test]
fn test_total_limit_during_training() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::with_accelerator(
        LocalAccelerator::cpu()
            .with_project_dir(tmp.path())
            .with_total_limit(Some(2)),
    );
    attach_checkpointer(&fixture.trainer, Vec::new())?;
    let sources = DataSources::train(constant_loss_source(1, 1.0)?)
        .with_eval(constant_loss_source(1, 1.0)?);

    fixture.trainer.run(sources, MaxIters::default(), 3)?;

    let mut names: Vec<String> = fs::read_dir(tmp.path().join("checkpoints"))?
        .map(|entry| -> Result<String> { Ok(entry?.file_name().to_string_lossy().into_owned()) })
        .collect::<Result<_>>()?;
    names.sort();
    assert_eq!(names, vec!["checkpoint_2", "checkpoint_3"]);
    Ok(())
}
