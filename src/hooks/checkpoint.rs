//! Checkpoint saving and best-copy promotion

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::accelerator::Checkpointable;
use crate::engine::{Context, Event};
use crate::error::{Error, Result};
use crate::trainer::{Role, Trainer};

/// Directory under the project dir holding a copy of the latest checkpoint
pub const BEST_ITERATION_DIR: &str = "best_iteration";

/// Save a checkpoint after every eval pass and copy it to `best_iteration`
///
/// Registers the model, the optimizer, both engines' run state and
/// `checkpoint_objects` with the accelerator. Both handlers are attached to
/// the eval engine's `Completed` event, save first, then copy. Fails when the
/// accelerator has no project directory.
pub fn attach_checkpointer(
    trainer: &Trainer,
    checkpoint_objects: Vec<Box<dyn Checkpointable>>,
) -> Result<()> {
    let accelerator = trainer.accelerator().clone();
    let best_dir = accelerator
        .project_dir()
        .map(|dir| dir.join(BEST_ITERATION_DIR))
        .ok_or_else(|| Error::config("checkpointing needs an accelerator project directory"))?;

    accelerator.prepare_model(trainer.model().clone());
    if let Some(optimizer) = trainer.optimizer() {
        accelerator.prepare_optimizer(optimizer.clone());
    }
    for role in Role::ALL {
        accelerator.register_for_checkpointing(Box::new(trainer.state_handle(role)));
    }
    for object in checkpoint_objects {
        accelerator.register_for_checkpointing(object);
    }

    let latest: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));

    let save_slot = latest.clone();
    let save_accelerator = accelerator.clone();
    trainer.add_event(Role::Eval, Event::Completed, move |_ctx: &mut Context<'_>| {
        if !save_accelerator.is_main_process() {
            return Ok(());
        }
        let path = save_accelerator.save_state()?;
        info!(path = %path.display(), "Saved checkpoint");
        *save_slot.lock() = Some(path);
        Ok(())
    });

    trainer.add_event(Role::Eval, Event::Completed, move |_ctx: &mut Context<'_>| {
        if !accelerator.is_main_process() {
            return Ok(());
        }
        let Some(source) = latest.lock().clone() else {
            return Ok(());
        };
        if best_dir.exists() {
            fs::remove_dir_all(&best_dir)?;
        }
        copy_dir(&source, &best_dir)?;
        debug!(from = %source.display(), to = %best_dir.display(), "Promoted checkpoint");
        Ok(())
    });

    Ok(())
}

/// Recursively copy `source` to `dest`
pub(crate) fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::internal(format!("walked outside {}: {}", source.display(), e)))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_dir_nested() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("src");
        fs::create_dir_all(source.join("inner"))?;
        fs::write(source.join("a.txt"), b"alpha")?;
        fs::write(source.join("inner").join("b.bin"), [1u8, 2, 3])?;

        let dest = tmp.path().join("dest");
        copy_dir(&source, &dest)?;

        assert_eq!(fs::read(dest.join("a.txt"))?, b"alpha");
        assert_eq!(fs::read(dest.join("inner").join("b.bin"))?, vec![1u8, 2, 3]);
        Ok(())
    }
}
