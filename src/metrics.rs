//! Attachable metrics
//!
//! A [`Metric`] accumulates over the outputs of an engine's iterations. How
//! it is reset, updated and read is decided by a [`MetricUsage`], so the same
//! metric object can report a running value mid-epoch or one value per epoch.

use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accelerator::Stateful;
use crate::engine::{Context, Engine, Event, EventSet};
use crate::error::Result;
use crate::model::{Outputs, LOGITS_KEY, TARGET_KEY};

/// Metric shared between the engines it is attached to
pub type SharedMetric = Arc<Mutex<dyn Metric>>;

/// Extracts `(prediction, target)` from step outputs; `None` skips the update
pub type OutputTransform = Arc<dyn Fn(&Outputs) -> Result<Option<(Tensor, Tensor)>> + Send + Sync>;

/// Accumulating metric
pub trait Metric: Stateful + Send {
    /// Clear accumulated values
    fn reset(&mut self);

    /// Accumulate one batch
    fn update(&mut self, prediction: &Tensor, target: &Tensor) -> Result<()>;

    /// Current value; `None` before any update
    fn compute(&self) -> Result<Option<f64>>;
}

/// Which events reset, update and publish a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricUsage {
    /// Reset accumulation
    pub started: Event,
    /// Update from the last output
    pub iteration_completed: Event,
    /// Publish the computed value
    pub completed: Event,
}

impl MetricUsage {
    /// Reset per epoch and publish after every iteration
    pub fn running_epoch() -> Self {
        Self {
            started: Event::EpochStarted,
            iteration_completed: Event::IterationCompleted,
            completed: Event::IterationCompleted,
        }
    }

    /// Reset per epoch and publish once the epoch completes
    pub fn epoch_wise() -> Self {
        Self {
            started: Event::EpochStarted,
            iteration_completed: Event::IterationCompleted,
            completed: Event::EpochCompleted,
        }
    }

    fn events(&self) -> EventSet {
        EventSet::of([self.started, self.iteration_completed, self.completed])
    }
}

impl Default for MetricUsage {
    fn default() -> Self {
        Self::running_epoch()
    }
}

/// Reads `(logits, target)` from the outputs
pub fn logits_target() -> OutputTransform {
    Arc::new(|outputs: &Outputs| {
        Ok(match (outputs.get(LOGITS_KEY), outputs.get(TARGET_KEY)) {
            (Some(logits), Some(target)) => Some((logits.clone(), target.clone())),
            _ => None,
        })
    })
}

/// Attach `metric` to `engine`, publishing it under `name`
pub fn attach_metric(
    engine: &mut Engine,
    name: impl Into<String>,
    metric: SharedMetric,
    usage: MetricUsage,
    transform: OutputTransform,
) {
    let name = name.into();
    engine.on(usage.events(), move |ctx: &mut Context<'_>| {
        let event = ctx.event();
        if event == usage.started {
            metric.lock().reset();
            ctx.remove_metric(&name);
        }
        if event == usage.iteration_completed {
            let pair = {
                let state = ctx.state();
                match state.last_output() {
                    Some(outputs) => transform(outputs)?,
                    None => None,
                }
            };
            if let Some((prediction, target)) = pair {
                metric.lock().update(&prediction, &target)?;
            }
        }
        if event == usage.completed {
            if let Some(value) = metric.lock().compute()? {
                ctx.set_metric(name.clone(), value);
            }
        }
        Ok(())
    });
}

/// Fraction of rows whose arg-max prediction equals the target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accuracy {
    correct: u64,
    total: u64,
}

impl Accuracy {
    /// Empty accuracy
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for [`attach_metric`]
    pub fn shared() -> SharedMetric {
        Arc::new(Mutex::new(Self::new()))
    }
}

impl Metric for Accuracy {
    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn update(&mut self, prediction: &Tensor, target: &Tensor) -> Result<()> {
        let predicted = prediction.argmax(D::Minus1)?;
        let target = target.to_dtype(DType::U32)?;
        let correct = predicted
            .eq(&target)?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;
        self.correct += correct as u64;
        self.total += target.elem_count() as u64;
        Ok(())
    }

    fn compute(&self) -> Result<Option<f64>> {
        if self.total == 0 {
            return Ok(None);
        }
        Ok(Some(self.correct as f64 / self.total as f64))
    }
}

impl Stateful for Accuracy {
    fn state_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_accuracy_counts_argmax_matches() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 1.0], [0.0, 3.0], [5.0, 1.0], [0.0, 1.0]], &device)?;
        let target = Tensor::new(&[0u32, 1, 1, 1], &device)?;

        let mut accuracy = Accuracy::new();
        assert_eq!(accuracy.compute()?, None);
        accuracy.update(&logits, &target)?;
        assert_relative_eq!(accuracy.compute()?.unwrap_or_default(), 0.75);

        accuracy.reset();
        assert_eq!(accuracy.compute()?, None);
        Ok(())
    }

    #[test]
    fn test_accuracy_state_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let mut accuracy = Accuracy::new();
        accuracy.update(
            &Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &device)?,
            &Tensor::new(&[0u32, 1], &device)?,
        )?;

        let mut restored = Accuracy::new();
        restored.load_state_dict(accuracy.state_dict()?)?;
        assert_eq!(restored, accuracy);
        Ok(())
    }

    #[test]
    fn test_usage_events() {
        assert_eq!(MetricUsage::running_epoch().events().iter().count(), 2);
        assert_eq!(MetricUsage::epoch_wise().events().iter().count(), 3);
    }

    #[test]
    fn test_logits_target_skips_incomplete_outputs() -> Result<()> {
        let transform = logits_target();
        let mut outputs = Outputs::new();
        outputs.insert(LOGITS_KEY.to_string(), Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?);
        assert!(transform(&outputs)?.is_none());
        Ok(())
    }
}
