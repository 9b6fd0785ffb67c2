//! Attachable lifecycle hooks
//!
//! Every hook only subscribes handlers to a [`Trainer`](crate::trainer::Trainer)'s
//! engines. Hooks are independent of each other except the checkpointer,
//! whose copy handler relies on running after its own save handler.

mod archive;
mod checkpoint;
mod debug;
mod epoch_log;
mod metrics;
mod output_store;
mod progress;

pub use archive::{attach_best_exp_saver, ARCHIVE_NAME, CONFIG_FILE};
pub use checkpoint::{attach_checkpointer, BEST_ITERATION_DIR};
pub use debug::attach_debug_handler;
pub use epoch_log::{attach_log_epoch_metrics, format_epoch_metrics};
pub use metrics::{attach_metrics, MetricFactory};
pub use output_store::{attach_output_store, OutputStore};
pub use progress::{attach_progress_bar, default_metric_names};
