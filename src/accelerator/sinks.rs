//! Metric sinks

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::Result;

/// Experiment-tracking backend
#[cfg_attr(test, mockall::automock)]
pub trait MetricSink: Send {
    /// Record metric values at an optional step
    fn log(&mut self, values: &BTreeMap<String, f64>, step: Option<u64>) -> Result<()>;

    /// Record run hyperparameters
    fn log_config(&mut self, project: &str, config: &BTreeMap<String, Value>) -> Result<()>;
}

/// Appends one JSON object per call to a local file
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating parent directories
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Output file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, record: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl MetricSink for JsonlSink {
    fn log(&mut self, values: &BTreeMap<String, f64>, step: Option<u64>) -> Result<()> {
        let record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "step": step,
            "values": values,
        });
        self.write_line(&record)
    }

    fn log_config(&mut self, project: &str, config: &BTreeMap<String, Value>) -> Result<()> {
        let record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "project": project,
            "config": config,
        });
        self.write_line(&record)
    }
}
