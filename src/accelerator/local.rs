//! Single-process accelerator writing checkpoints to a local directory
//!
//! Checkpoint layout:
//!
//! ```text
//! {project_dir}/checkpoints/checkpoint_{n}/
//!     model.safetensors
//!     optimizer.bin
//!     custom_checkpoint_{i}.json
//!     checkpoint.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::SharedModel;
use crate::optim::{Optimizer, OptimizerState, SharedOptimizer};

use super::{Accelerator, Checkpointable, MetricSink};

/// Checkpoint format version written to the manifest
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINTS_DIR: &str = "checkpoints";
const CHECKPOINT_PREFIX: &str = "checkpoint_";
const MANIFEST_FILE: &str = "checkpoint.json";
const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.bin";

/// Contents summary of one checkpoint directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Format version
    pub version: u32,
    /// Checkpoint number within the project
    pub index: usize,
    /// Save time
    pub created_at: DateTime<Utc>,
    /// Whether model parameters were saved
    pub has_model: bool,
    /// Whether optimizer state was saved
    pub has_optimizer: bool,
    /// Number of registered custom objects saved
    pub custom_objects: usize,
}

/// Single-process [`Accelerator`]
pub struct LocalAccelerator {
    device: Device,
    project_dir: Option<PathBuf>,
    gradient_accumulation_steps: usize,
    total_limit: Option<usize>,
    main_process: bool,
    step: AtomicUsize,
    model: Mutex<Option<SharedModel>>,
    optimizer: Mutex<Option<SharedOptimizer>>,
    objects: Mutex<Vec<Box<dyn Checkpointable>>>,
    sinks: Mutex<Vec<Box<dyn MetricSink>>>,
}

impl LocalAccelerator {
    /// Accelerator on `device` without a project directory
    pub fn new(device: Device) -> Self {
        Self {
            device,
            project_dir: None,
            gradient_accumulation_steps: 1,
            total_limit: None,
            main_process: true,
            step: AtomicUsize::new(0),
            model: Mutex::new(None),
            optimizer: Mutex::new(None),
            objects: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// CPU accelerator
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Write checkpoints below `dir`
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Synchronise gradients every `steps` steps
    pub fn with_gradient_accumulation_steps(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps.max(1);
        self
    }

    /// Keep at most `limit` checkpoint directories
    pub fn with_total_limit(mut self, limit: Option<usize>) -> Self {
        self.total_limit = limit;
        self
    }

    /// Act as a secondary process that skips file writes and logging
    pub fn with_main_process(mut self, main_process: bool) -> Self {
        self.main_process = main_process;
        self
    }

    /// Add a metric sink
    pub fn with_sink(self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.lock().push(sink);
        self
    }

    /// Gradient accumulation window
    pub fn gradient_accumulation_steps(&self) -> usize {
        self.gradient_accumulation_steps
    }

    /// Existing checkpoint directories, oldest first
    pub fn checkpoints(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .list_checkpoints()?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn checkpoints_root(&self) -> Result<PathBuf> {
        self.project_dir
            .as_ref()
            .map(|dir| dir.join(CHECKPOINTS_DIR))
            .ok_or_else(|| Error::config("automatic checkpoint naming needs a project directory"))
    }

    fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let root = self.checkpoints_root()?;
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|index| index.parse::<usize>().ok());
            if let Some(index) = index {
                if entry.file_type()?.is_dir() {
                    found.push((index, entry.path()));
                }
            }
        }
        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }

    fn enforce_total_limit(&self) -> Result<()> {
        let Some(limit) = self.total_limit else {
            return Ok(());
        };
        let checkpoints = self.list_checkpoints()?;
        let excess = checkpoints.len().saturating_sub(limit);
        for (_, path) in checkpoints.into_iter().take(excess) {
            debug!(path = %path.display(), "Removing old checkpoint");
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

impl Accelerator for LocalAccelerator {
    fn device(&self) -> &Device {
        &self.device
    }

    fn is_main_process(&self) -> bool {
        self.main_process
    }

    fn accumulate(&self) -> bool {
        let step = self.step.fetch_add(1, Ordering::SeqCst) + 1;
        step % self.gradient_accumulation_steps == 0
    }

    fn end_accumulation(&self) -> bool {
        self.step.swap(0, Ordering::SeqCst) % self.gradient_accumulation_steps != 0
    }

    fn backward(&self, loss: &Tensor, optimizer: &mut dyn Optimizer) -> Result<()> {
        let loss = if self.gradient_accumulation_steps > 1 {
            (loss / self.gradient_accumulation_steps as f64)?
        } else {
            loss.clone()
        };
        let grads = loss.backward()?;
        optimizer.accumulate(&grads)
    }

    fn prepare_model(&self, model: SharedModel) -> SharedModel {
        *self.model.lock() = Some(model.clone());
        model
    }

    fn prepare_optimizer(&self, optimizer: SharedOptimizer) -> SharedOptimizer {
        *self.optimizer.lock() = Some(optimizer.clone());
        optimizer
    }

    fn register_for_checkpointing(&self, object: Box<dyn Checkpointable>) {
        self.objects.lock().push(object);
    }

    fn save_state(&self) -> Result<PathBuf> {
        let root = self.checkpoints_root()?;
        let index = self
            .list_checkpoints()?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        let dir = root.join(format!("{}{}", CHECKPOINT_PREFIX, index));
        fs::create_dir_all(&dir)?;

        let has_model = match self.model.lock().as_ref() {
            Some(model) => {
                model.read().save(&dir.join(MODEL_FILE))?;
                true
            }
            None => false,
        };
        let has_optimizer = match self.optimizer.lock().as_ref() {
            Some(optimizer) => {
                let state = optimizer.lock().state_dict()?;
                fs::write(dir.join(OPTIMIZER_FILE), bincode::serialize(&state)?)?;
                true
            }
            None => false,
        };

        let objects = self.objects.lock();
        for (i, object) in objects.iter().enumerate() {
            let state = object.state_dict()?;
            fs::write(
                dir.join(format!("custom_checkpoint_{}.json", i)),
                serde_json::to_vec_pretty(&state)?,
            )?;
        }

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            index,
            created_at: Utc::now(),
            has_model,
            has_optimizer,
            custom_objects: objects.len(),
        };
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
        drop(objects);

        self.enforce_total_limit()?;
        debug!(path = %dir.display(), "Checkpoint written");
        Ok(dir)
    }

    fn load_state(&self, dir: &Path) -> Result<()> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::checkpoint(format!(
                "no checkpoint manifest in {}",
                dir.display()
            )));
        }
        let manifest: CheckpointManifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(Error::checkpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }

        let objects = self.objects.lock();
        if manifest.custom_objects != objects.len() {
            return Err(Error::checkpoint(format!(
                "checkpoint holds {} custom objects but {} are registered",
                manifest.custom_objects,
                objects.len()
            )));
        }

        if manifest.has_model {
            if let Some(model) = self.model.lock().as_ref() {
                model.write().load(&dir.join(MODEL_FILE))?;
            }
        }
        if manifest.has_optimizer {
            if let Some(optimizer) = self.optimizer.lock().as_ref() {
                let state: OptimizerState = bincode::deserialize(&fs::read(dir.join(OPTIMIZER_FILE))?)?;
                optimizer.lock().load_state_dict(state)?;
            }
        }
        for (i, object) in objects.iter().enumerate() {
            let bytes = fs::read(dir.join(format!("custom_checkpoint_{}.json", i)))?;
            object.load_state_dict(serde_json::from_slice(&bytes)?)?;
        }

        info!(path = %dir.display(), index = manifest.index, "Checkpoint restored");
        Ok(())
    }

    fn project_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref()
    }

    fn log(&self, values: &BTreeMap<String, f64>, step: Option<u64>) -> Result<()> {
        if !self.main_process {
            return Ok(());
        }
        for sink in self.sinks.lock().iter_mut() {
            sink.log(values, step)?;
        }
        Ok(())
    }

    fn init_trackers(&self, project: &str, config: &BTreeMap<String, Value>) -> Result<()> {
        if !self.main_process {
            return Ok(());
        }
        for sink in self.sinks.lock().iter_mut() {
            sink.log_config(project, config)?;
        }
        Ok(())
    }
}
