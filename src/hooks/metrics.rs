//! Metric aggregation on both engines

use std::collections::BTreeMap;

use crate::metrics::{attach_metric, logits_target, MetricUsage, SharedMetric};
use crate::trainer::{Role, Trainer};

/// Builds a fresh metric instance per engine
pub type MetricFactory = Box<dyn Fn() -> SharedMetric + Send + Sync>;

/// Attach every metric to both engines and return the created instances
///
/// Each engine gets its own instance, fed `(logits, target)` from the step
/// outputs. Values are reset at epoch start and published after every
/// iteration, so they are current mid-epoch.
pub fn attach_metrics(trainer: &Trainer, metrics: &BTreeMap<String, MetricFactory>) -> Vec<SharedMetric> {
    let mut created = Vec::new();
    for role in Role::ALL {
        let engine = trainer.engine(role);
        let mut engine = engine.lock();
        for (name, make) in metrics {
            let metric = make();
            attach_metric(
                &mut engine,
                name.clone(),
                metric.clone(),
                MetricUsage::running_epoch(),
                logits_target(),
            );
            created.push(metric);
        }
    }
    created
}
