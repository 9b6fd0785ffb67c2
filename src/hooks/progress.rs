//! Per-engine progress bars

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};

use crate::engine::state::LOSS_METRIC;
use crate::engine::{Context, Event, EventSet, Metrics};
use crate::error::{Error, Result};
use crate::trainer::{Role, Trainer};

const BAR_TEMPLATE: &str =
    "{prefix:.yellow} [{pos}/{len}] {percent:>3}%|{bar:30.cyan/blue}| {msg} ({elapsed}<{eta}, {per_sec})";
const SPINNER_TEMPLATE: &str = "{prefix:.yellow} {spinner} [{pos}] {msg} ({elapsed}, {per_sec})";

/// `loss` followed by `metrics`, for every role
pub fn default_metric_names(metrics: &[String]) -> BTreeMap<Role, Vec<String>> {
    let names: Vec<String> = std::iter::once(LOSS_METRIC.to_string())
        .chain(metrics.iter().cloned())
        .collect();
    Role::ALL.into_iter().map(|role| (role, names.clone())).collect()
}

/// Render one progress bar per epoch on each engine
///
/// `metric_names` lists per role which live metric values are shown; roles
/// without an entry show counters only. Bars are hidden on secondary
/// processes.
pub fn attach_progress_bar(trainer: &Trainer, metric_names: &BTreeMap<Role, Vec<String>>) -> Result<()> {
    let bar_style = ProgressStyle::with_template(BAR_TEMPLATE)
        .map_err(|e| Error::internal(format!("invalid progress template: {}", e)))?
        .progress_chars("█▉▊▋▌▍▎▏ ");
    let spinner_style = ProgressStyle::with_template(SPINNER_TEMPLATE)
        .map_err(|e| Error::internal(format!("invalid progress template: {}", e)))?;
    let visible = trainer.accelerator().is_main_process();

    for role in Role::ALL {
        let names = metric_names.get(&role).cloned().unwrap_or_default();
        let bar_style = bar_style.clone();
        let spinner_style = spinner_style.clone();
        trainer.add_event_with(
            role,
            EventSet::of([Event::EpochStarted, Event::IterationCompleted, Event::EpochCompleted]),
            None::<ProgressBar>,
            move |ctx: &mut Context<'_>, bar: &mut Option<ProgressBar>| {
                match ctx.event() {
                    Event::EpochStarted => {
                        let (epoch, max_epochs, length) = {
                            let state = ctx.state();
                            (state.epoch(), state.max_epochs(), state.epoch_length())
                        };
                        let new_bar = match (visible, length) {
                            (false, _) => ProgressBar::hidden(),
                            (true, Some(length)) => {
                                ProgressBar::new(length as u64).with_style(bar_style.clone())
                            }
                            (true, None) => ProgressBar::new_spinner().with_style(spinner_style.clone()),
                        };
                        new_bar.set_prefix(prefix(role, epoch, max_epochs));
                        *bar = Some(new_bar);
                    }
                    Event::IterationCompleted => {
                        if let Some(bar) = bar.as_ref() {
                            bar.set_message(postfix(&ctx.metrics(), &names));
                            bar.inc(1);
                        }
                    }
                    Event::EpochCompleted => {
                        if let Some(bar) = bar.take() {
                            bar.set_message(postfix(&ctx.metrics(), &names));
                            match role {
                                Role::Train => bar.finish(),
                                Role::Eval => bar.finish_and_clear(),
                            }
                        }
                    }
                    _ => {}
                }
                Ok(())
            },
        );
    }
    Ok(())
}

fn prefix(role: Role, epoch: usize, max_epochs: usize) -> String {
    let name = match role {
        Role::Train => "Train",
        Role::Eval => "Eval",
    };
    if max_epochs > 1 {
        format!("{} [{}/{}]", name, epoch, max_epochs)
    } else {
        name.to_string()
    }
}

fn postfix(metrics: &Metrics, names: &[String]) -> String {
    names
        .iter()
        .filter_map(|name| metrics.get(name).map(|value| format!("{}={:.4}", name, value)))
        .collect::<Vec<_>>()
        .join(", ")
}
