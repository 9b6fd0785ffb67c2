//! Execution collaborator seam
//!
//! The engine never touches devices, gradient synchronisation, checkpoint
//! files or tracking backends directly. It goes through an [`Accelerator`].

pub mod local;
pub mod sinks;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::model::SharedModel;
use crate::optim::{Optimizer, SharedOptimizer};

pub use local::{CheckpointManifest, LocalAccelerator, CHECKPOINT_VERSION};
pub use sinks::{JsonlSink, MetricSink};

/// State that can be captured into and restored from a checkpoint
pub trait Stateful {
    /// Capture state
    fn state_dict(&self) -> Result<Value>;

    /// Restore state
    fn load_state_dict(&mut self, state: Value) -> Result<()>;
}

/// Shared-handle form of [`Stateful`] registered with an accelerator
pub trait Checkpointable: Send + Sync {
    /// Capture state
    fn state_dict(&self) -> Result<Value>;

    /// Restore state
    fn load_state_dict(&self, state: Value) -> Result<()>;
}

impl<T> Checkpointable for Arc<Mutex<T>>
where
    T: Stateful + Send + ?Sized,
{
    fn state_dict(&self) -> Result<Value> {
        Stateful::state_dict(&*self.lock())
    }

    fn load_state_dict(&self, state: Value) -> Result<()> {
        Stateful::load_state_dict(&mut *self.lock(), state)
    }
}

/// Device placement, gradient sync, checkpoint and tracking primitives
pub trait Accelerator: Send + Sync {
    /// Device tensors live on
    fn device(&self) -> &Device;

    /// Whether this process owns file writes and logging
    fn is_main_process(&self) -> bool;

    /// Enter one gradient-accumulation step; true when gradients sync this step
    fn accumulate(&self) -> bool;

    /// Close the current accumulation window; true when it held unsynced steps
    fn end_accumulation(&self) -> bool;

    /// Backpropagate `loss` into the optimizer's gradient buffers
    fn backward(&self, loss: &Tensor, optimizer: &mut dyn Optimizer) -> Result<()>;

    /// Register the model for checkpointing and return it
    fn prepare_model(&self, model: SharedModel) -> SharedModel;

    /// Register the optimizer for checkpointing and return it
    fn prepare_optimizer(&self, optimizer: SharedOptimizer) -> SharedOptimizer;

    /// Include `object` in every saved checkpoint, in registration order
    fn register_for_checkpointing(&self, object: Box<dyn Checkpointable>);

    /// Write a checkpoint directory and return its path
    fn save_state(&self) -> Result<PathBuf>;

    /// Restore everything registered from a checkpoint directory
    fn load_state(&self, dir: &Path) -> Result<()>;

    /// Root directory for checkpoints, when configured
    fn project_dir(&self) -> Option<&Path>;

    /// Forward values to the metric sinks
    fn log(&self, values: &BTreeMap<String, f64>, step: Option<u64>) -> Result<()>;

    /// Announce a run and its hyperparameters to the metric sinks
    fn init_trackers(&self, project: &str, config: &BTreeMap<String, Value>) -> Result<()>;
}
