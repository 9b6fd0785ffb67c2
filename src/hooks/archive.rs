//! Bundles the configuration and best checkpoint into one archive

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::{Context, Event};
use crate::error::Result;
use crate::trainer::{Role, Trainer};

use super::checkpoint::BEST_ITERATION_DIR;

/// Archive written to the experiment directory
pub const ARCHIVE_NAME: &str = "experiment.tar.gz";

/// Configuration entry inside the archive
pub const CONFIG_FILE: &str = "config.yaml";

/// Write `{dir}/experiment.tar.gz` with the config and `best_iteration/` when training completes
///
/// When `dir` is not an existing directory an error is logged and nothing is
/// attached. A missing `best_iteration` at completion skips the archive with a
/// warning.
pub fn attach_best_exp_saver<C: Serialize>(trainer: &Trainer, dir: &Path, config: &C) -> Result<()> {
    if !dir.is_dir() {
        error!(dir = %dir.display(), "Experiment directory does not exist; best experiment will not be archived");
        return Ok(());
    }
    let rendered = serde_yaml::to_string(config)?.into_bytes();
    let dir = dir.to_path_buf();
    let accelerator = trainer.accelerator().clone();

    trainer.add_event(Role::Train, Event::Completed, move |_ctx: &mut Context<'_>| {
        if !accelerator.is_main_process() {
            return Ok(());
        }
        let best = dir.join(BEST_ITERATION_DIR);
        if !best.is_dir() {
            warn!(path = %best.display(), "No best checkpoint to archive");
            return Ok(());
        }
        let archive = write_archive(&dir, &best, &rendered)?;
        info!(path = %archive.display(), "Archived best experiment");
        Ok(())
    });
    Ok(())
}

fn write_archive(dir: &Path, best: &Path, config: &[u8]) -> Result<PathBuf> {
    let path = dir.join(ARCHIVE_NAME);
    let encoder = GzEncoder::new(File::create(&path)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_size(config.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, CONFIG_FILE, config)?;
    builder.append_dir_all(BEST_ITERATION_DIR, best)?;

    builder.into_inner()?.finish()?;
    Ok(path)
}
