//! Epochal - event-driven training and evaluation engine
//!
//! A [`Trainer`] drives two [`Engine`]s: `train`, which updates parameters,
//! and `eval`, which runs a full pass at the start of every training epoch
//! and once more at the end. Both engines fire lifecycle events that hooks
//! subscribe to for metrics, progress bars, checkpoints and archives.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_core::Device;
//! use parking_lot::{Mutex, RwLock};
//! use epochal::{Classifier, DataSources, InMemorySource, LocalAccelerator, MaxIters, Sgd, Trainer};
//!
//! # fn main() -> epochal::Result<()> {
//! let classifier = Classifier::new(50, 2, &Device::Cpu)?;
//! let sgd = Sgd::new(classifier.var_map(), 0.1, 0.0, 0.0)?;
//! let trainer = Trainer::new(
//!     Arc::new(RwLock::new(classifier)),
//!     Some(Arc::new(Mutex::new(sgd))),
//!     Arc::new(LocalAccelerator::cpu()),
//! );
//! let sources = DataSources::train(InMemorySource::new(Vec::new()))
//!     .with_eval(InMemorySource::new(Vec::new()));
//! let report = trainer.run(sources, MaxIters::default(), 3)?;
//! println!("{:?}", report.state.metrics().get("loss"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod accelerator;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;

#[cfg(test)]
mod tests;

// Re-exports
pub use accelerator::{Accelerator, Checkpointable, JsonlSink, LocalAccelerator, MetricSink, Stateful};
pub use config::{flatten_config, ExperimentConfig};
pub use engine::{
    Context, DataSource, Engine, Event, EventSet, InMemorySource, IterSource, Metrics, RunOutcome,
    RunState,
};
pub use error::{Error, Result};
pub use experiment::Experiment;
pub use logging::init_logging;
pub use metrics::{Accuracy, Metric, MetricUsage};
pub use model::{Batch, Classifier, Model, Outputs};
pub use optim::{Optimizer, Sgd};
pub use trainer::{DataSources, InterruptHandle, MaxIters, Role, RunReport, Trainer};
