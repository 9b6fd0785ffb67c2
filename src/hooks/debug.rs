//! Epoch truncation for short development runs

use tracing::debug;

use crate::engine::{Context, Event};
use crate::trainer::{Role, Trainer};

/// End every epoch of both engines after `num_iters` iterations
///
/// Metrics of a truncated epoch are averages over the iterations that ran.
pub fn attach_debug_handler(trainer: &Trainer, num_iters: usize) {
    for role in Role::ALL {
        trainer.add_event(role, Event::IterationCompleted, move |ctx: &mut Context<'_>| {
            if ctx.state().epoch_iteration() < num_iters {
                return Ok(());
            }
            debug!(engine = %role, num_iters, "Debug iteration cap reached");
            ctx.terminate_epoch();
            Ok(())
        });
    }
}
