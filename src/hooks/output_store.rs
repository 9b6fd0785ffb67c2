//! Collects step outputs of the latest epoch

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{Context, Event, EventSet};
use crate::model::Outputs;
use crate::trainer::{Role, Trainer};

/// Outputs of every iteration of an engine's latest epoch
#[derive(Clone, Default)]
pub struct OutputStore {
    outputs: Arc<Mutex<Vec<Outputs>>>,
}

impl OutputStore {
    /// Copy of the stored outputs, in iteration order
    pub fn outputs(&self) -> Vec<Outputs> {
        self.outputs.lock().clone()
    }

    /// Number of stored outputs
    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.outputs.lock().is_empty()
    }

    /// Take the stored outputs, leaving the store empty
    pub fn take(&self) -> Vec<Outputs> {
        std::mem::take(&mut *self.outputs.lock())
    }
}

/// Store the outputs of `role`'s iterations; cleared at each epoch start
pub fn attach_output_store(trainer: &Trainer, role: Role) -> OutputStore {
    let store = OutputStore::default();
    let outputs = store.outputs.clone();
    trainer.add_event(
        role,
        EventSet::of([Event::EpochStarted, Event::IterationCompleted]),
        move |ctx: &mut Context<'_>| {
            match ctx.event() {
                Event::EpochStarted => outputs.lock().clear(),
                Event::IterationCompleted => {
                    if let Some(output) = ctx.state().last_output().cloned() {
                        outputs.lock().push(output);
                    }
                }
                _ => {}
            }
            Ok(())
        },
    );
    store
}
