use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::sync::Arc;

use approx::assert_relative_eq;
use flate2::read::GzDecoder;
use parking_lot::Mutex;

use super::fixtures::*;
use crate::accelerator::sinks::MockMetricSink;
use crate::accelerator::LocalAccelerator;
use crate::engine::{Event, InMemorySource};
use crate::error::{Error, Result};
use crate::hooks::{
    attach_best_exp_saver, attach_checkpointer, attach_debug_handler, attach_log_epoch_metrics,
    attach_metrics, attach_output_store, attach_progress_bar, default_metric_names, MetricFactory,
    ARCHIVE_NAME, BEST_ITERATION_DIR, CONFIG_FILE,
};
use crate::metrics::{Accuracy, SharedMetric};
use crate::model::Batch;
use crate::trainer::{DataSources, MaxIters, Role};

fn accuracy_factories() -> BTreeMap<String, MetricFactory> {
    let make: MetricFactory = Box::new(|| -> SharedMetric { Accuracy::shared() });
    BTreeMap::from([("accuracy".to_string(), make)])
}

fn accuracy_batches() -> Result<Vec<Batch>> {
    Ok(vec![
        classification_batch(&[[2.0, 1.0], [0.0, 3.0]], &[0, 1])?,
        classification_batch(&[[2.0, 1.0], [0.0, 3.0]], &[1, 0])?,
    ])
}

fn project_fixture(dir: &std::path::Path) -> EchoFixture {
    EchoFixture::with_accelerator(LocalAccelerator::cpu().with_project_dir(dir))
}

fn checkpoint_dirs(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir.join("checkpoints"))?
        .map(|entry| -> Result<String> { Ok(entry?.file_name().to_string_lossy().into_owned()) })
        .collect::<Result<_>>()?;
    names.sort();
    Ok(names)
}

#[test]
fn test_debug_handler_truncates_both_engines() -> Result<()> {
    let fixture = EchoFixture::new();
    attach_debug_handler(&fixture.trainer, 3);
    let losses: Vec<f32> = (1..=10).map(|i| i as f32).collect();
    let sources = DataSources::train(loss_source(&losses)?).with_eval(loss_source(&losses)?);

    let report = fixture.trainer.run(sources, MaxIters::default(), 2)?;

    let train = fixture.trainer.state(Role::Train);
    assert_eq!(train.epoch(), 2);
    assert_eq!(train.epoch_iteration(), 3);
    assert_eq!(train.iteration(), 6);
    assert_relative_eq!(train.metrics().get("loss").unwrap_or(f64::NAN), 2.0, epsilon = 1e-6);
    assert_eq!(report.state.epoch_iteration(), 3);
    assert_relative_eq!(report.state.metrics().get("loss").unwrap_or(f64::NAN), 2.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_running_accuracy_on_both_engines() -> Result<()> {
    let fixture = EchoFixture::new();
    let instances = attach_metrics(&fixture.trainer, &accuracy_factories());
    assert_eq!(instances.len(), 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    fixture.trainer.add_event(Role::Train, Event::IterationCompleted, move |ctx| {
        sink.lock().push(ctx.state().metrics().get("accuracy"));
        Ok(())
    });
    let sources = DataSources::train(InMemorySource::new(accuracy_batches()?))
        .with_eval(InMemorySource::new(accuracy_batches()?));

    let report = fixture.trainer.run(sources, MaxIters::default(), 2)?;

    assert_eq!(*seen.lock(), vec![Some(1.0), Some(0.5), Some(1.0), Some(0.5)]);
    assert_eq!(report.state.metrics().get("accuracy"), Some(0.5));
    assert_eq!(fixture.trainer.state(Role::Train).metrics().get("accuracy"), Some(0.5));
    Ok(())
}

#[test]
fn test_epoch_metrics_reach_sinks() -> Result<()> {
    let mut sink = MockMetricSink::new();
    sink.expect_log()
        .withf(|values, step| {
            step.is_none() && values.get("loss_epoch/train").copied() == Some(2.0)
        })
        .times(2)
        .returning(|_, _| Ok(()));
    let fixture = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_sink(Box::new(sink)));
    attach_log_epoch_metrics(&fixture.trainer);

    fixture
        .trainer
        .run(DataSources::train(constant_loss_source(3, 2.0)?), MaxIters::default(), 2)?;
    Ok(())
}

#[test]
fn test_eval_epoch_metrics_use_eval_suffix() -> Result<()> {
    let logged = Arc::new(Mutex::new(Vec::new()));
    let record = logged.clone();
    let mut sink = MockMetricSink::new();
    sink.expect_log().returning(move |values, _| {
        record.lock().extend(values.keys().cloned());
        Ok(())
    });
    let fixture = EchoFixture::with_accelerator(LocalAccelerator::cpu().with_sink(Box::new(sink)));
    attach_log_epoch_metrics(&fixture.trainer);
    let sources = DataSources::train(constant_loss_source(2, 1.0)?)
        .with_eval(constant_loss_source(2, 1.0)?);

    fixture.trainer.run(sources, MaxIters::default(), 1)?;

    assert_eq!(
        *logged.lock(),
        vec!["loss_epoch/eval", "loss_epoch/train", "loss_epoch/eval"]
    );
    Ok(())
}

#[test]
fn test_epoch_metrics_skipped_on_secondary_process() -> Result<()> {
    let mut sink = MockMetricSink::new();
    sink.expect_log().never();
    let fixture = EchoFixture::with_accelerator(
        LocalAccelerator::cpu()
            .with_main_process(false)
            .with_sink(Box::new(sink)),
    );
    attach_log_epoch_metrics(&fixture.trainer);

    fixture
        .trainer
        .run(DataSources::train(constant_loss_source(2, 1.0)?), MaxIters::default(), 1)?;
    Ok(())
}

#[test]
fn test_best_iteration_matches_latest_checkpoint() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = project_fixture(tmp.path());
    attach_checkpointer(&fixture.trainer, Vec::new())?;

    fixture.trainer.evaluate(&mut constant_loss_source(2, 1.0)?, None)?;

    assert_eq!(checkpoint_dirs(tmp.path())?, vec!["checkpoint_0"]);
    let checkpoint = dir_contents(&tmp.path().join("checkpoints").join("checkpoint_0"))?;
    let best = dir_contents(&tmp.path().join(BEST_ITERATION_DIR))?;
    assert_eq!(best, checkpoint);
    let names: Vec<&str> = best.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "checkpoint.json",
            "custom_checkpoint_0.json",
            "custom_checkpoint_1.json",
            "model.safetensors",
            "optimizer.bin",
        ]
    );
    Ok(())
}

#[test]
fn test_checkpoint_after_every_eval_pass() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = project_fixture(tmp.path());
    attach_checkpointer(&fixture.trainer, Vec::new())?;
    let sources = DataSources::train(constant_loss_source(2, 1.0)?)
        .with_eval(constant_loss_source(2, 1.0)?);

    fixture.trainer.run(sources, MaxIters::default(), 2)?;

    assert_eq!(
        checkpoint_dirs(tmp.path())?,
        vec!["checkpoint_0", "checkpoint_1", "checkpoint_2"]
    );
    let latest = dir_contents(&tmp.path().join("checkpoints").join("checkpoint_2"))?;
    assert_eq!(dir_contents(&tmp.path().join(BEST_ITERATION_DIR))?, latest);
    Ok(())
}

#[test]
fn test_checkpointer_requires_project_dir() {
    let fixture = EchoFixture::new();
    let result = attach_checkpointer(&fixture.trainer, Vec::new());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_secondary_process_writes_no_checkpoints() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::with_accelerator(
        LocalAccelerator::cpu()
            .with_project_dir(tmp.path())
            .with_main_process(false),
    );
    attach_checkpointer(&fixture.trainer, Vec::new())?;

    fixture.trainer.evaluate(&mut constant_loss_source(1, 1.0)?, None)?;

    assert!(!tmp.path().join("checkpoints").exists());
    assert!(!tmp.path().join(BEST_ITERATION_DIR).exists());
    Ok(())
}

#[test]
fn test_archive_holds_config_and_best_checkpoint() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = project_fixture(tmp.path());
    attach_checkpointer(&fixture.trainer, Vec::new())?;
    let config = serde_json::json!({ "name": "demo", "epochs": 1 });
    attach_best_exp_saver(&fixture.trainer, tmp.path(), &config)?;
    let sources = DataSources::train(constant_loss_source(2, 1.0)?)
        .with_eval(constant_loss_source(2, 1.0)?);

    fixture.trainer.run(sources, MaxIters::default(), 1)?;

    let mut archive = tar::Archive::new(GzDecoder::new(File::open(tmp.path().join(ARCHIVE_NAME))?));
    let mut paths = Vec::new();
    let mut rendered = String::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        if path == CONFIG_FILE {
            entry.read_to_string(&mut rendered)?;
        }
        paths.push(path);
    }
    assert!(paths.contains(&CONFIG_FILE.to_string()));
    assert!(paths.contains(&format!("{}/checkpoint.json", BEST_ITERATION_DIR)));
    assert!(paths.contains(&format!("{}/model.safetensors", BEST_ITERATION_DIR)));

    let restored: serde_json::Value = serde_yaml::from_str(&rendered)?;
    assert_eq!(restored, config);
    Ok(())
}

#[test]
fn test_archive_skipped_without_best_checkpoint() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = project_fixture(tmp.path());
    attach_best_exp_saver(&fixture.trainer, tmp.path(), &serde_json::json!({}))?;

    fixture
        .trainer
        .run(DataSources::train(constant_loss_source(1, 1.0)?), MaxIters::default(), 1)?;

    assert!(!tmp.path().join(ARCHIVE_NAME).exists());
    Ok(())
}

#[test]
fn test_archive_not_attached_for_missing_dir() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let fixture = EchoFixture::new();
    let engine = fixture.trainer.engine(Role::Train);
    let before = engine.lock().handler_count(Event::Completed);

    attach_best_exp_saver(&fixture.trainer, &tmp.path().join("missing"), &serde_json::json!({}))?;

    assert_eq!(engine.lock().handler_count(Event::Completed), before);
    Ok(())
}

#[test]
fn test_output_store_keeps_latest_epoch() -> Result<()> {
    let fixture = EchoFixture::new();
    let store = attach_output_store(&fixture.trainer, Role::Eval);

    fixture.trainer.evaluate(&mut constant_loss_source(3, 1.0)?, None)?;
    assert_eq!(store.len(), 3);

    fixture.trainer.evaluate(&mut loss_source(&[4.0, 5.0])?, None)?;
    let outputs = store.take();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[1]["loss"].to_scalar::<f32>()?, 5.0);
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn test_progress_bars_do_not_alter_run() -> Result<()> {
    let fixture = EchoFixture::new();
    let names = default_metric_names(&["accuracy".to_string()]);
    assert_eq!(names[&Role::Train], vec!["loss", "accuracy"]);
    attach_progress_bar(&fixture.trainer, &names)?;
    let sources = DataSources::train(constant_loss_source(3, 1.0)?)
        .with_eval(constant_loss_source(2, 1.0)?);

    let report = fixture.trainer.run(sources, MaxIters::default(), 1)?;

    assert_eq!(fixture.trainer.state(Role::Train).epoch_iteration(), 3);
    assert_eq!(report.state.epoch_iteration(), 2);
    Ok(())
}
