//! Lifecycle events and the per-engine event bus

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;

use super::state::{Metrics, RunState};

/// Named transition points of an engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Run is starting, before the first epoch
    Started,
    /// Epoch is starting; counters for the epoch are already reset
    EpochStarted,
    /// One batch was consumed by the step function
    IterationCompleted,
    /// Epoch finished, either exhausted or terminated early
    EpochCompleted,
    /// Run finished
    Completed,
    /// Run stopped on an interrupt request
    Interrupted,
}

impl Event {
    /// Every event, in lifecycle order
    pub const ALL: [Event; 6] = [
        Event::Started,
        Event::EpochStarted,
        Event::IterationCompleted,
        Event::EpochCompleted,
        Event::Completed,
        Event::Interrupted,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::EpochStarted => "epoch_started",
            Event::IterationCompleted => "iteration_completed",
            Event::EpochCompleted => "epoch_completed",
            Event::Completed => "completed",
            Event::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of events one subscription listens to
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventSet(u8);

impl EventSet {
    /// Set with no events
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set built from a list of events
    pub fn of(events: impl IntoIterator<Item = Event>) -> Self {
        events.into_iter().fold(Self::empty(), Self::with)
    }

    /// Copy of this set with `event` added
    pub fn with(self, event: Event) -> Self {
        Self(self.0 | event.bit())
    }

    /// Union of two sets
    pub fn union(self, other: EventSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether `event` is in the set
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Events of the set in lifecycle order
    pub fn iter(self) -> impl Iterator<Item = Event> {
        Event::ALL.into_iter().filter(move |event| self.contains(*event))
    }
}

impl From<Event> for EventSet {
    fn from(event: Event) -> Self {
        Self::empty().with(event)
    }
}

impl<const N: usize> From<[Event; N]> for EventSet {
    fn from(events: [Event; N]) -> Self {
        Self::of(events)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Early-exit requests raised by handlers during one run
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Signals {
    pub(crate) terminate_epoch: bool,
    pub(crate) terminate: bool,
}

/// Read-only view of the run state held for the duration of a borrow
pub struct StateRef<'a>(MutexGuard<'a, RunState>);

impl Deref for StateRef<'_> {
    type Target = RunState;

    fn deref(&self) -> &RunState {
        &self.0
    }
}

/// What a handler sees when an event fires
///
/// The run state lock is only taken for the duration of a [`Context::state`]
/// borrow or a metric write; do not keep a [`StateRef`] alive while calling
/// another method on the context.
pub struct Context<'a> {
    event: Event,
    state: &'a Mutex<RunState>,
    signals: &'a mut Signals,
    interrupt: &'a AtomicBool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        event: Event,
        state: &'a Mutex<RunState>,
        signals: &'a mut Signals,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self {
            event,
            state,
            signals,
            interrupt,
        }
    }

    /// Event being dispatched
    pub fn event(&self) -> Event {
        self.event
    }

    /// Read access to the run state
    pub fn state(&self) -> StateRef<'_> {
        StateRef(self.state.lock())
    }

    /// Public metrics at this point of the run, without scratch accumulators
    pub fn metrics(&self) -> Metrics {
        let mut public = Metrics::default();
        for (key, value) in self.state.lock().metrics().public() {
            public.set(key, value);
        }
        public
    }

    /// Write a metric value
    pub fn set_metric(&self, key: impl Into<String>, value: f64) {
        self.state.lock().metrics_mut().set(key, value);
    }

    /// Remove a metric value
    pub fn remove_metric(&self, key: &str) -> Option<f64> {
        self.state.lock().metrics_mut().remove(key)
    }

    /// End the current epoch after this iteration; `EpochCompleted` still fires
    pub fn terminate_epoch(&mut self) {
        self.signals.terminate_epoch = true;
    }

    /// End the run after the current epoch; `Completed` still fires
    pub fn terminate(&mut self) {
        self.signals.terminate = true;
    }

    /// Request an interrupt of this engine
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Whether an interrupt of this engine is pending
    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Whether early epoch termination was requested
    pub fn is_terminating_epoch(&self) -> bool {
        self.signals.terminate_epoch || self.signals.terminate
    }
}

/// Event handler
pub type Handler = Box<dyn FnMut(&mut Context<'_>) -> Result<()> + Send>;

struct Subscription {
    events: EventSet,
    handler: Handler,
}

/// Ordered multi-subscriber dispatch
///
/// Subscriptions are additive. Handlers run synchronously in registration
/// order, and the first error stops dispatch and is returned to the caller.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event in `events`
    ///
    /// A multi-event subscription runs once per firing of any of its events.
    pub fn subscribe<F>(&mut self, events: impl Into<EventSet>, handler: F)
    where
        F: FnMut(&mut Context<'_>) -> Result<()> + Send + 'static,
    {
        self.subscriptions.push(Subscription {
            events: events.into(),
            handler: Box::new(handler),
        });
    }

    /// Register `handler` with bound arguments handed to it on every call
    pub fn subscribe_with<A, F>(&mut self, events: impl Into<EventSet>, mut args: A, mut handler: F)
    where
        A: Send + 'static,
        F: FnMut(&mut Context<'_>, &mut A) -> Result<()> + Send + 'static,
    {
        self.subscribe(events, move |ctx: &mut Context<'_>| handler(ctx, &mut args));
    }

    /// Dispatch `ctx.event()` to every matching handler
    pub fn fire(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let event = ctx.event();
        for subscription in &mut self.subscriptions {
            if subscription.events.contains(event) {
                (subscription.handler)(ctx)?;
            }
        }
        Ok(())
    }

    /// Number of subscriptions listening to `event`
    pub fn handler_count(&self, event: Event) -> usize {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.events.contains(event))
            .count()
    }

    /// Number of subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
