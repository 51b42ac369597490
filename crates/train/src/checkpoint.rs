//! Best-checkpoint tracking.
//!
//! The checkpoint file only ever holds the parameters that reached the
//! highest evaluation accuracy seen so far in the run. It is written on
//! strict improvement and replaced wholesale (write to a sibling temp file,
//! then rename), so a reader never sees a half-written snapshot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use robust_core::Classifier;

/// Persist `model` to `path` iff `current > best`; return the new best.
///
/// Ties keep the earlier checkpoint.
pub fn consider_update(current: f64, best: f64, model: &Classifier, path: &Path) -> Result<f64> {
    if current > best {
        write_checkpoint(model, path)?;
        tracing::info!(
            accuracy = format!("{current:.5}"),
            previous = format!("{best:.5}"),
            path = %path.display(),
            "New best checkpoint"
        );
        Ok(current)
    } else {
        Ok(best)
    }
}

fn write_checkpoint(model: &Classifier, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    model
        .save(&tmp)
        .with_context(|| format!("write checkpoint {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("move checkpoint into place at {}", path.display()))?;
    Ok(())
}

// ── BestCheckpoint ──────────────────────────────────────────────────────────

/// Run-wide best accuracy plus the checkpoint path it guards. The best value
/// starts at 0 and never decreases; it is not reset between stages.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    path: PathBuf,
    best: f64,
    writes: usize,
}

impl BestCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: 0.0,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Number of checkpoint writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Offer an evaluation result; writes the checkpoint on improvement.
    pub fn consider(&mut self, accuracy: f64, model: &Classifier) -> Result<f64> {
        let updated = consider_update(accuracy, self.best, model, &self.path)?;
        if updated > self.best {
            self.writes += 1;
        }
        self.best = updated;
        Ok(updated)
    }

    /// Overwrite `model`'s parameters with the checkpoint written by this
    /// tracker. A file at `path` that this tracker never wrote (left over from
    /// an earlier run) is not a checkpoint of this run and is refused.
    pub fn reload_into(&self, model: &mut Classifier) -> Result<()> {
        if self.writes == 0 {
            anyhow::bail!(
                "no checkpoint at {} to reload (best accuracy so far: {:.5}); \
                 no evaluation in this run has improved on the initial best of 0",
                self.path.display(),
                self.best
            );
        }
        model
            .load(&self.path)
            .with_context(|| format!("reload checkpoint {}", self.path.display()))?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
