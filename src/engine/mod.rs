//! Event-driven epoch/iteration engine
//!
//! An [`Engine`] runs a step function over the batches of a [`DataSource`]
//! for a number of epochs and fires lifecycle [`Event`]s at each transition:
//!
//! ```text
//! Started
//!   EpochStarted  IterationCompleted*  EpochCompleted   (per epoch)
//! Completed | Interrupted
//! ```

pub mod data;
pub mod events;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::model::{Batch, Outputs};

pub use data::{BatchIter, DataSource, InMemorySource, IterSource};
pub use events::{Context, Event, EventBus, EventSet, Handler, StateRef};
pub use state::{EngineSnapshot, EngineStatus, Metrics, RunState, SCRATCH_LOSS_KEY, SCRATCH_PREFIX};

use events::Signals;

/// Run state shared between an engine and its observers
pub type SharedState = Arc<Mutex<RunState>>;

/// Step function run once per batch
pub type StepFn = Box<dyn FnMut(&mut RunState, Batch) -> Result<Outputs> + Send>;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every requested epoch ran, or the run was terminated early on request
    Completed,
    /// An interrupt request stopped the run; the next run resumes it
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct ResumePoint {
    epoch: usize,
    iteration: usize,
}

/// One nested epoch/iteration state machine
pub struct Engine {
    name: String,
    state: SharedState,
    step: StepFn,
    bus: EventBus,
    signals: Signals,
    interrupt: Arc<AtomicBool>,
    resume_from: Option<ResumePoint>,
}

impl Engine {
    /// Create an engine running `step` on every batch
    pub fn new<F>(name: impl Into<String>, step: F) -> Self
    where
        F: FnMut(&mut RunState, Batch) -> Result<Outputs> + Send + 'static,
    {
        let name = name.into();
        Self {
            state: Arc::new(Mutex::new(RunState::new(name.clone()))),
            name,
            step: Box::new(step),
            bus: EventBus::new(),
            signals: Signals::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            resume_from: None,
        }
    }

    /// Engine role name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe a handler
    pub fn on<F>(&mut self, events: impl Into<EventSet>, handler: F)
    where
        F: FnMut(&mut Context<'_>) -> Result<()> + Send + 'static,
    {
        self.bus.subscribe(events, handler);
    }

    /// Subscribe a handler with bound arguments
    pub fn on_with<A, F>(&mut self, events: impl Into<EventSet>, args: A, handler: F)
    where
        A: Send + 'static,
        F: FnMut(&mut Context<'_>, &mut A) -> Result<()> + Send + 'static,
    {
        self.bus.subscribe_with(events, args, handler);
    }

    /// Number of handlers subscribed to `event`
    pub fn handler_count(&self, event: Event) -> usize {
        self.bus.handler_count(event)
    }

    /// Copy of the current run state
    pub fn state(&self) -> RunState {
        self.state.lock().clone()
    }

    /// Shared handle to the run state
    pub fn state_handle(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Flag that interrupts this engine when set
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Request a cooperative interrupt
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Whether the next run resumes an interrupted one
    pub fn has_pending_resume(&self) -> bool {
        self.resume_from.is_some()
    }

    /// Run over `source` for up to `max_epochs` epochs (default 1)
    ///
    /// `epoch_length` caps the iterations per epoch; a shorter source ends
    /// the epoch early. An error from the step function or a handler aborts
    /// the run and is returned unchanged.
    #[instrument(skip(self, source), fields(engine = %self.name))]
    pub fn run(
        &mut self,
        source: &mut dyn DataSource,
        epoch_length: Option<usize>,
        max_epochs: Option<usize>,
    ) -> Result<RunOutcome> {
        let result = self.run_epochs(source, epoch_length, max_epochs.unwrap_or(1));
        self.state.lock().set_status(EngineStatus::Idle);
        result
    }

    fn run_epochs(
        &mut self,
        source: &mut dyn DataSource,
        epoch_length: Option<usize>,
        max_epochs: usize,
    ) -> Result<RunOutcome> {
        self.interrupt.store(false, Ordering::SeqCst);
        self.signals = Signals::default();
        {
            let mut state = self.state.lock();
            match self.resume_from.take() {
                Some(resume) => {
                    debug!(epoch = resume.epoch + 1, "Resuming interrupted run");
                    state.rewind(resume.epoch, resume.iteration, max_epochs);
                }
                None => state.reset(max_epochs),
            }
            state.set_status(EngineStatus::Running);
        }
        debug!(max_epochs, ?epoch_length, "Engine run started");

        self.fire(Event::Started)?;

        loop {
            let (epoch, iteration) = {
                let state = self.state.lock();
                (state.epoch(), state.iteration())
            };
            let resume = ResumePoint { epoch, iteration };
            if self.interrupted() {
                return self.interrupt_run(resume);
            }
            if epoch >= max_epochs {
                break;
            }

            let expected = match (epoch_length, source.len_hint()) {
                (Some(cap), Some(len)) => Some(cap.min(len)),
                (cap, len) => cap.or(len),
            };
            {
                let mut state = self.state.lock();
                state.begin_epoch(expected);
                state.set_status(EngineStatus::Running);
            }
            self.fire(Event::EpochStarted)?;
            if self.interrupted() {
                return self.interrupt_run(resume);
            }

            let mut batches = source.epoch()?;
            loop {
                if let Some(cap) = epoch_length {
                    if self.state.lock().epoch_iteration() >= cap {
                        break;
                    }
                }
                let batch = match batches.next() {
                    Some(batch) => batch?,
                    None => break,
                };
                {
                    let mut state = self.state.lock();
                    let output = (self.step)(&mut state, batch)?;
                    state.complete_iteration(output);
                }
                self.fire(Event::IterationCompleted)?;

                if self.interrupted() {
                    drop(batches);
                    return self.interrupt_run(resume);
                }
                if self.signals.terminate_epoch || self.signals.terminate {
                    self.state.lock().set_status(EngineStatus::TerminatingEpoch);
                    break;
                }
            }
            drop(batches);

            self.fire(Event::EpochCompleted)?;
            self.signals.terminate_epoch = false;
            {
                let state = self.state.lock();
                debug!(
                    epoch = state.epoch(),
                    iterations = state.epoch_iteration(),
                    "Epoch completed"
                );
            }
            if self.signals.terminate {
                debug!("Run terminated on request");
                break;
            }
        }

        if self.interrupted() {
            let resume = {
                let state = self.state.lock();
                ResumePoint {
                    epoch: state.epoch(),
                    iteration: state.iteration(),
                }
            };
            return self.interrupt_run(resume);
        }
        self.fire(Event::Completed)?;
        debug!(iterations = self.state.lock().iteration(), "Engine run finished");
        Ok(RunOutcome::Completed)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn interrupt_run(&mut self, resume: ResumePoint) -> Result<RunOutcome> {
        info!(
            engine = %self.name,
            completed_epochs = resume.epoch,
            "Run interrupted; the next run resumes after the last completed epoch"
        );
        self.resume_from = Some(resume);
        self.fire(Event::Interrupted)?;
        Ok(RunOutcome::Interrupted)
    }

    fn fire(&mut self, event: Event) -> Result<()> {
        let Self {
            state,
            bus,
            signals,
            interrupt,
            ..
        } = self;
        let mut ctx = Context::new(event, &**state, signals, &**interrupt);
        bus.fire(&mut ctx)
    }
}
