//! Trainer: a train engine with a nested eval engine
//!
//! The eval engine runs one full pass at the start of every training epoch
//! and once more when training completes. An eval pass runs synchronously
//! inside the train engine's handler, so train never advances while eval is
//! running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::accelerator::Accelerator;
use crate::engine::state::LOSS_METRIC;
use crate::engine::{
    Context, DataSource, Engine, Event, EventSet, RunOutcome, RunState, SharedState,
    SCRATCH_LOSS_KEY,
};
use crate::error::{Error, Result};
use crate::model::{detach_outputs, scalar, Batch, Outputs, SharedModel, LOSS_KEY};
use crate::optim::SharedOptimizer;

pub use crate::config::MaxIters;

/// Engine shared between a trainer and its hooks
pub type SharedEngine = Arc<Mutex<Engine>>;

/// Loop role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Parameter-updating loop
    Train,
    /// Forward-only loop
    Eval,
}

impl Role {
    /// Both roles
    pub const ALL: [Role; 2] = [Role::Train, Role::Eval];

    /// Role name, also the engine name
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Train => "train",
            Role::Eval => "eval",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Role::Train),
            "eval" => Ok(Role::Eval),
            other => Err(Error::config(format!("unknown engine role '{}'", other))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data for one [`Trainer::run`]
pub struct DataSources {
    /// Training batches
    pub train: Box<dyn DataSource>,
    /// Evaluation batches; no eval passes run without them
    pub eval: Option<Box<dyn DataSource>>,
}

impl DataSources {
    /// Training data only
    pub fn train(train: impl DataSource + 'static) -> Self {
        Self {
            train: Box::new(train),
            eval: None,
        }
    }

    /// Add evaluation data
    pub fn with_eval(mut self, eval: impl DataSource + 'static) -> Self {
        self.eval = Some(Box::new(eval));
        self
    }
}

/// Result of a trainer run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// `Interrupted` when the train run or any eval pass was interrupted
    pub outcome: RunOutcome,
    /// Eval run state when eval data was supplied, train run state otherwise
    pub state: RunState,
}

/// Interrupts both engines of a trainer from any thread
#[derive(Clone)]
pub struct InterruptHandle {
    flags: Vec<Arc<AtomicBool>>,
}

impl InterruptHandle {
    /// Request cooperative termination at the next epoch or iteration boundary
    pub fn interrupt(&self) {
        for flag in &self.flags {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct EvalInput {
    source: Option<Box<dyn DataSource>>,
    max_iters: Option<usize>,
    interrupted: bool,
}

/// Two coordinated engines around one model
pub struct Trainer {
    model: SharedModel,
    optimizer: Option<SharedOptimizer>,
    accelerator: Arc<dyn Accelerator>,
    train: SharedEngine,
    eval: SharedEngine,
    train_state: SharedState,
    eval_state: SharedState,
    interrupts: InterruptHandle,
    eval_input: Arc<Mutex<EvalInput>>,
}

impl Trainer {
    /// Create a trainer; without an optimizer only loss-free batches can train
    pub fn new(
        model: SharedModel,
        optimizer: Option<SharedOptimizer>,
        accelerator: Arc<dyn Accelerator>,
    ) -> Self {
        let train = Engine::new(
            Role::Train.as_str(),
            train_step(model.clone(), optimizer.clone(), accelerator.clone()),
        );
        let eval = Engine::new(Role::Eval.as_str(), eval_step(model.clone()));

        let trainer = Self {
            model,
            optimizer,
            accelerator,
            train_state: train.state_handle(),
            eval_state: eval.state_handle(),
            interrupts: InterruptHandle {
                flags: vec![train.interrupt_handle(), eval.interrupt_handle()],
            },
            train: Arc::new(Mutex::new(train)),
            eval: Arc::new(Mutex::new(eval)),
            eval_input: Arc::new(Mutex::new(EvalInput::default())),
        };
        trainer.register_eval_trigger();
        trainer.train.lock().on(
            EventSet::of([Event::Started, Event::EpochCompleted]),
            flush_gradients(trainer.optimizer.clone(), trainer.accelerator.clone()),
        );
        for role in Role::ALL {
            let engine = trainer.engine(role);
            let mut engine = engine.lock();
            engine.on(Event::EpochStarted, reset_epoch_loss);
            engine.on(Event::IterationCompleted, update_loss);
        }
        trainer
    }

    fn register_eval_trigger(&self) {
        let eval = self.eval.clone();
        let input = self.eval_input.clone();
        self.train.lock().on(
            EventSet::of([Event::EpochStarted, Event::Completed]),
            move |ctx: &mut Context<'_>| {
                let mut input = input.lock();
                let max_iters = input.max_iters;
                let Some(source) = input.source.as_mut() else {
                    return Ok(());
                };
                if ctx.is_interrupt_requested() {
                    return Ok(());
                }
                debug!(trigger = %ctx.event(), "Running evaluation");
                let outcome = eval.lock().run(source.as_mut(), max_iters, Some(1))?;
                if outcome == RunOutcome::Interrupted {
                    input.interrupted = true;
                    ctx.interrupt();
                }
                Ok(())
            },
        );
    }

    /// Train for `epochs` epochs, evaluating at each epoch start and at the end
    #[instrument(skip(self, sources, max_iters))]
    pub fn run(&self, sources: DataSources, max_iters: MaxIters, epochs: usize) -> Result<RunReport> {
        let DataSources { mut train, eval } = sources;
        let has_eval = eval.is_some();
        *self.eval_input.lock() = EvalInput {
            source: eval,
            max_iters: max_iters.eval,
            interrupted: false,
        };
        info!(epochs, has_eval, "Starting training");

        let result = self.train.lock().run(train.as_mut(), max_iters.train, Some(epochs));

        let eval_interrupted = {
            let mut input = self.eval_input.lock();
            input.source = None;
            input.interrupted
        };
        let mut outcome = result?;
        if eval_interrupted {
            outcome = RunOutcome::Interrupted;
        }

        let role = if has_eval { Role::Eval } else { Role::Train };
        let state = self.state(role);
        info!(?outcome, metrics = ?state.metrics().public_map(), "Training finished");
        Ok(RunReport { outcome, state })
    }

    /// Run the eval engine alone for one pass
    #[instrument(skip(self, source))]
    pub fn evaluate(&self, source: &mut dyn DataSource, max_iters: Option<usize>) -> Result<RunReport> {
        let outcome = self.eval.lock().run(source, max_iters, Some(1))?;
        Ok(RunReport {
            outcome,
            state: self.state(Role::Eval),
        })
    }

    /// Attach a handler to one engine
    ///
    /// Must not be called from inside a handler of the same engine.
    pub fn add_event<F>(&self, role: Role, events: impl Into<EventSet>, handler: F)
    where
        F: FnMut(&mut Context<'_>) -> Result<()> + Send + 'static,
    {
        self.engine(role).lock().on(events, handler);
    }

    /// Attach a handler with bound arguments to one engine
    pub fn add_event_with<A, F>(&self, role: Role, events: impl Into<EventSet>, args: A, handler: F)
    where
        A: Send + 'static,
        F: FnMut(&mut Context<'_>, &mut A) -> Result<()> + Send + 'static,
    {
        self.engine(role).lock().on_with(events, args, handler);
    }

    /// Engine for `role`
    pub fn engine(&self, role: Role) -> SharedEngine {
        match role {
            Role::Train => self.train.clone(),
            Role::Eval => self.eval.clone(),
        }
    }

    /// Copy of the run state of `role`
    pub fn state(&self, role: Role) -> RunState {
        self.state_handle(role).lock().clone()
    }

    /// Shared run state of `role`; readable while the engine runs
    pub fn state_handle(&self, role: Role) -> SharedState {
        match role {
            Role::Train => self.train_state.clone(),
            Role::Eval => self.eval_state.clone(),
        }
    }

    /// Compute model
    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    /// Optimizer, absent for inference-only trainers
    pub fn optimizer(&self) -> Option<&SharedOptimizer> {
        self.optimizer.as_ref()
    }

    /// Execution collaborator
    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    /// Handle that interrupts both engines
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupts.clone()
    }

    /// Request cooperative termination of both engines
    ///
    /// Call from another thread or through an [`InterruptHandle`] while a run
    /// is in progress; handlers use [`Context::interrupt`] instead.
    pub fn interrupt(&self) {
        self.interrupts.interrupt();
    }
}

fn train_step(
    model: SharedModel,
    optimizer: Option<SharedOptimizer>,
    accelerator: Arc<dyn Accelerator>,
) -> impl FnMut(&mut RunState, Batch) -> Result<Outputs> + Send + 'static {
    move |state: &mut RunState, batch: Batch| {
        let sync = accelerator.accumulate();
        let outputs = {
            let mut model = model.write();
            model.set_training(true);
            model.forward(&batch)?
        };
        if !outputs.contains_key(LOSS_KEY) {
            return Ok(outputs);
        }
        let loss = outputs[LOSS_KEY].clone();
        let Some(optimizer) = optimizer.as_ref() else {
            return Err(Error::config(
                "train step produced a loss but the trainer has no optimizer",
            ));
        };
        {
            let mut optimizer = optimizer.lock();
            accelerator.backward(&loss, &mut *optimizer)?;
            if sync {
                optimizer.step()?;
                optimizer.zero_grad();
            }
        }
        state.metrics_mut().accumulate(SCRATCH_LOSS_KEY, scalar(&loss)?);
        Ok(detach_outputs(outputs))
    }
}

/// Apply gradients left in a partial accumulation window at epoch end
///
/// At run start a partial window can only come from an interrupted epoch that
/// is about to be replayed, so its gradients are discarded instead.
fn flush_gradients(
    optimizer: Option<SharedOptimizer>,
    accelerator: Arc<dyn Accelerator>,
) -> impl FnMut(&mut Context<'_>) -> Result<()> + Send + 'static {
    move |ctx: &mut Context<'_>| {
        if !accelerator.end_accumulation() {
            return Ok(());
        }
        let Some(optimizer) = optimizer.as_ref() else {
            return Ok(());
        };
        let mut optimizer = optimizer.lock();
        if ctx.event() == Event::EpochCompleted {
            debug!("Applying gradients of a partial accumulation window");
            optimizer.step()?;
        }
        optimizer.zero_grad();
        Ok(())
    }
}

fn eval_step(model: SharedModel) -> impl FnMut(&mut RunState, Batch) -> Result<Outputs> + Send + 'static {
    move |state: &mut RunState, batch: Batch| {
        let outputs = {
            let mut model = model.write();
            model.set_training(false);
            detach_outputs(model.forward(&batch)?)
        };
        if let Some(loss) = outputs.get(LOSS_KEY) {
            let loss = scalar(loss)?;
            state.metrics_mut().accumulate(SCRATCH_LOSS_KEY, loss);
        }
        Ok(outputs)
    }
}

fn reset_epoch_loss(ctx: &mut Context<'_>) -> Result<()> {
    ctx.remove_metric(LOSS_METRIC);
    Ok(())
}

fn update_loss(ctx: &mut Context<'_>) -> Result<()> {
    let (sum, iterations) = {
        let state = ctx.state();
        (state.metrics().get(SCRATCH_LOSS_KEY), state.epoch_iteration())
    };
    if let Some(sum) = sum {
        if iterations > 0 {
            ctx.set_metric(LOSS_METRIC, sum / iterations as f64);
        }
    }
    Ok(())
}
