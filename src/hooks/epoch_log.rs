//! Epoch-end metric logging and export

use std::collections::BTreeMap;

use tracing::info;

use crate::engine::{Context, Event};
use crate::trainer::{Role, Trainer};

/// Log public metrics at every epoch end and forward them to the metric sinks
///
/// Sink keys are `"{metric}_epoch/{role}"`. Only the main process logs.
pub fn attach_log_epoch_metrics(trainer: &Trainer) {
    for role in Role::ALL {
        let accelerator = trainer.accelerator().clone();
        trainer.add_event(role, Event::EpochCompleted, move |ctx: &mut Context<'_>| {
            if !accelerator.is_main_process() {
                return Ok(());
            }
            let metrics = ctx.state().metrics().public_map();
            if metrics.is_empty() {
                return Ok(());
            }
            for line in format_epoch_metrics(role, &metrics) {
                info!("{}", line);
            }
            let values: BTreeMap<String, f64> = metrics
                .into_iter()
                .map(|(name, value)| (format!("{}_epoch/{}", name, role), value))
                .collect();
            accelerator.log(&values, None)
        });
    }
}

/// Table lines: a role header, then one `name | value` row per metric
///
/// Rows are sorted by name length, then name.
pub fn format_epoch_metrics(role: Role, metrics: &BTreeMap<String, f64>) -> Vec<String> {
    let width = metrics.keys().map(String::len).max().unwrap_or(0);
    let mut names: Vec<&String> = metrics.keys().collect();
    names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let header = match role {
        Role::Train => "Train",
        Role::Eval => "Eval",
    };
    std::iter::once(header.to_string())
        .chain(
            names
                .into_iter()
                .map(|name| format!("{:<width$} | {:.4}", name, metrics[name], width = width)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_epoch_metrics_layout() {
        let metrics = BTreeMap::from([
            ("accuracy".to_string(), 0.5),
            ("loss".to_string(), 1.23456),
            ("f1".to_string(), 0.25),
        ]);
        let lines = format_epoch_metrics(Role::Eval, &metrics);
        assert_eq!(
            lines,
            vec![
                "Eval".to_string(),
                "f1       | 0.2500".to_string(),
                "loss     | 1.2346".to_string(),
                "accuracy | 0.5000".to_string(),
            ]
        );
    }
}
