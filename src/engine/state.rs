//! Run state owned by one engine
//!
//! Counters are private with crate-internal setters, so observers can read
//! them but only the engine advances them. Arbitrary metric values live in
//! one explicit [`Metrics`] map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accelerator::Stateful;
use crate::error::Result;
use crate::model::Outputs;

/// Prefix marking accumulation scratch keys
pub const SCRATCH_PREFIX: &str = "_";

/// Scratch accumulator for the summed loss of the current epoch
pub const SCRATCH_LOSS_KEY: &str = "_loss";

/// Public per-epoch average loss
pub const LOSS_METRIC: &str = "loss";

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Not running
    #[default]
    Idle,
    /// Executing an epoch
    Running,
    /// Early end of the current epoch was requested
    TerminatingEpoch,
}

/// Metric values keyed by name
///
/// Keys starting with [`SCRATCH_PREFIX`] are accumulators; every other key is
/// a public, reported value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    /// Whether a key is an accumulation scratch key
    pub fn is_scratch(key: &str) -> bool {
        key.starts_with(SCRATCH_PREFIX)
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.0.remove(key)
    }

    /// Add `value` into the accumulator stored at `key`
    pub fn accumulate(&mut self, key: impl Into<String>, value: f64) {
        *self.0.entry(key.into()).or_insert(0.0) += value;
    }

    /// Drop every scratch key
    pub fn clear_scratch(&mut self) {
        self.0.retain(|key, _| !Self::is_scratch(key));
    }

    /// Drop every key
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Public (non-scratch) entries in key order
    pub fn public(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0
            .iter()
            .filter(|(key, _)| !Self::is_scratch(key))
            .map(|(key, value)| (key.as_str(), *value))
    }

    /// Public entries collected into an owned map
    pub fn public_map(&self) -> BTreeMap<String, f64> {
        self.public().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// All entries including scratch
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    /// Number of entries including scratch
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mutable progress record of one engine
#[derive(Debug, Clone)]
pub struct RunState {
    name: String,
    status: EngineStatus,
    epoch: usize,
    iteration: usize,
    epoch_iteration: usize,
    max_epochs: usize,
    epoch_length: Option<usize>,
    metrics: Metrics,
    last_output: Option<Outputs>,
}

impl RunState {
    /// Fresh state for an engine called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: EngineStatus::Idle,
            epoch: 0,
            iteration: 0,
            epoch_iteration: 0,
            max_epochs: 1,
            epoch_length: None,
            metrics: Metrics::default(),
            last_output: None,
        }
    }

    /// Engine role name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle status
    pub fn status(&self) -> EngineStatus {
        self.status
    }

    /// Current epoch, 1-based while an epoch runs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Iterations completed over the whole run
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Iterations completed in the current epoch
    pub fn epoch_iteration(&self) -> usize {
        self.epoch_iteration
    }

    /// Epoch budget of the current run
    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    /// Expected iterations of the current epoch, when known
    pub fn epoch_length(&self) -> Option<usize> {
        self.epoch_length
    }

    /// Metric values
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Mutable metric values, for step functions
    pub fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    /// Output of the most recent step
    pub fn last_output(&self) -> Option<&Outputs> {
        self.last_output.as_ref()
    }

    /// Restartable fields
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            name: self.name.clone(),
            epoch: self.epoch,
            iteration: self.iteration,
            epoch_iteration: self.epoch_iteration,
            metrics: self.metrics.clone(),
        }
    }

    /// Overwrite restartable fields from a snapshot
    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        self.name = snapshot.name;
        self.epoch = snapshot.epoch;
        self.iteration = snapshot.iteration;
        self.epoch_iteration = snapshot.epoch_iteration;
        self.metrics = snapshot.metrics;
    }

    pub(crate) fn set_status(&mut self, status: EngineStatus) {
        self.status = status;
    }

    /// Reset counters and metrics for a fresh run
    pub(crate) fn reset(&mut self, max_epochs: usize) {
        self.epoch = 0;
        self.iteration = 0;
        self.epoch_iteration = 0;
        self.max_epochs = max_epochs;
        self.epoch_length = None;
        self.metrics.clear();
        self.last_output = None;
    }

    /// Rewind to the start of an interrupted epoch
    pub(crate) fn rewind(&mut self, epoch: usize, iteration: usize, max_epochs: usize) {
        self.epoch = epoch;
        self.iteration = iteration;
        self.epoch_iteration = 0;
        self.max_epochs = max_epochs;
        self.metrics.clear_scratch();
        self.last_output = None;
    }

    pub(crate) fn begin_epoch(&mut self, epoch_length: Option<usize>) {
        self.epoch += 1;
        self.epoch_iteration = 0;
        self.epoch_length = epoch_length;
        self.metrics.clear_scratch();
    }

    pub(crate) fn complete_iteration(&mut self, output: Outputs) {
        self.last_output = Some(output);
        self.epoch_iteration += 1;
        self.iteration += 1;
    }
}

/// Restartable subset of [`RunState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Engine role name
    pub name: String,
    /// Epoch counter
    pub epoch: usize,
    /// Whole-run iteration counter
    pub iteration: usize,
    /// Iterations in the current epoch
    pub epoch_iteration: usize,
    /// Metrics including scratch accumulators
    pub metrics: Metrics,
}

impl Stateful for RunState {
    fn state_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        let snapshot: EngineSnapshot = serde_json::from_value(state)?;
        self.restore(snapshot);
        Ok(())
    }
}
