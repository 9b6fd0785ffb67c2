//! Config-driven experiment wiring
//!
//! An [`Experiment`] turns an [`ExperimentConfig`] into a local accelerator
//! and a [`Trainer`] with the standard hooks attached, then runs it.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use candle_core::Device;
use tracing::{info, instrument};

use crate::accelerator::{Accelerator, Checkpointable, JsonlSink, LocalAccelerator, MetricSink};
use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::hooks::{
    attach_best_exp_saver, attach_checkpointer, attach_debug_handler, attach_log_epoch_metrics,
    attach_metrics, attach_progress_bar, default_metric_names, MetricFactory,
};
use crate::metrics::SharedMetric;
use crate::model::SharedModel;
use crate::optim::SharedOptimizer;
use crate::trainer::{DataSources, InterruptHandle, Role, RunReport, Trainer};

/// Attaches user handlers once the trainer is built
pub type EventAttacher = Box<dyn FnOnce(&Trainer) -> Result<()>>;

/// A configured training run
pub struct Experiment {
    config: ExperimentConfig,
    device: Device,
    metrics: BTreeMap<String, MetricFactory>,
    events: Vec<EventAttacher>,
    sinks: Vec<Box<dyn MetricSink>>,
    interrupt: Option<InterruptHandle>,
}

impl Experiment {
    /// Experiment on CPU
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
            metrics: BTreeMap::new(),
            events: Vec::new(),
            sinks: Vec::new(),
            interrupt: None,
        })
    }

    /// Place tensors on `device`
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Attach a metric to both engines under `name`
    pub fn with_metric<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> SharedMetric + Send + Sync + 'static,
    {
        self.metrics.insert(name.into(), Box::new(factory));
        self
    }

    /// Attach user handlers after the standard hooks
    pub fn with_events<F>(mut self, attach: F) -> Self
    where
        F: FnOnce(&Trainer) -> Result<()> + 'static,
    {
        self.events.push(Box::new(attach));
        self
    }

    /// Add a metric sink besides the configured ones
    pub fn with_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Configuration
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Device tensors are placed on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Build the accelerator and trainer with every hook attached
    ///
    /// Hooks are attached in this order: debug truncation, metrics, progress
    /// bars, epoch-metric logging, then checkpointing and archiving when an
    /// experiment directory is configured, then user handlers.
    #[instrument(skip_all, fields(experiment = %self.config.name))]
    pub fn build_trainer(
        &mut self,
        model: SharedModel,
        optimizer: Option<SharedOptimizer>,
    ) -> Result<Trainer> {
        let accelerator = Arc::new(self.build_accelerator()?);
        let model = accelerator.prepare_model(model);
        let optimizer = optimizer.map(|optimizer| accelerator.prepare_optimizer(optimizer));
        let trainer = Trainer::new(model, optimizer, accelerator);

        if self.config.debug.enabled {
            attach_debug_handler(&trainer, self.config.debug.num_iters);
        }
        let metric_instances = attach_metrics(&trainer, &self.metrics);
        if self.config.progress.enabled {
            attach_progress_bar(&trainer, &self.progress_metric_names()?)?;
        }
        attach_log_epoch_metrics(&trainer);
        if let Some(dir) = self.config.dir.clone() {
            let objects = metric_instances
                .into_iter()
                .map(|metric| Box::new(metric) as Box<dyn Checkpointable>)
                .collect();
            attach_checkpointer(&trainer, objects)?;
            attach_best_exp_saver(&trainer, &dir, &self.config)?;
        }
        for attach in self.events.drain(..) {
            attach(&trainer)?;
        }

        self.interrupt = Some(trainer.interrupt_handle());
        Ok(trainer)
    }

    /// Build the trainer and run the configured number of epochs
    pub fn run(
        &mut self,
        model: SharedModel,
        optimizer: Option<SharedOptimizer>,
        sources: DataSources,
    ) -> Result<RunReport> {
        info!(config = %serde_json::to_string(&self.config)?, "Starting experiment");
        let trainer = self.build_trainer(model, optimizer)?;
        let report = trainer.run(sources, self.config.max_iters, self.config.epochs)?;
        info!(
            outcome = ?report.outcome,
            metrics = %serde_json::to_string(&report.state.metrics().public_map())?,
            "Experiment finished"
        );
        Ok(report)
    }

    /// Interrupt a running experiment; no-op before the trainer is built
    pub fn interrupt(&self) {
        if let Some(handle) = &self.interrupt {
            handle.interrupt();
        }
    }

    /// Interrupt handle of the built trainer
    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.interrupt.clone()
    }

    fn build_accelerator(&mut self) -> Result<LocalAccelerator> {
        let mut accelerator = LocalAccelerator::new(self.device.clone())
            .with_gradient_accumulation_steps(self.config.gradient_accumulation_steps)
            .with_total_limit(self.config.checkpoint_total_limit);
        if let Some(dir) = &self.config.dir {
            fs::create_dir_all(dir)?;
            accelerator = accelerator.with_project_dir(dir);
        }
        if let Some(path) = &self.config.tracking.jsonl {
            accelerator = accelerator.with_sink(Box::new(JsonlSink::new(path)?));
        }
        for sink in self.sinks.drain(..) {
            accelerator = accelerator.with_sink(sink);
        }
        accelerator.init_trackers(&self.config.name, &self.config.flattened()?)?;
        Ok(accelerator)
    }

    fn progress_metric_names(&self) -> Result<BTreeMap<Role, Vec<String>>> {
        if self.config.progress.metric_names.is_empty() {
            let names: Vec<String> = self.metrics.keys().cloned().collect();
            return Ok(default_metric_names(&names));
        }
        self.config
            .progress
            .metric_names
            .iter()
            .map(|(role, names)| Ok((role.parse::<Role>()?, names.clone())))
            .collect()
    }
}
