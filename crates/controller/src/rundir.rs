#![forbid(unsafe_code)]

use crate::error::ControllerError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Per-slot scratch directories, leased to one run at a time and wiped on
/// every allocation.
pub(crate) struct RundirPool {
    base: PathBuf,
    max: usize,
    leased: BTreeSet<usize>,
}

impl RundirPool {
    pub(crate) fn new(base: PathBuf, max: usize) -> Self {
        Self {
            base,
            max,
            leased: BTreeSet::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<PathBuf, ControllerError> {
        let slot = (0..)
            .find(|i| !self.leased.contains(i))
            .unwrap_or(self.leased.len());
        if self.max > 0 && slot >= self.max {
            return Err(ControllerError::Config(format!(
                "all {} rundirs are leased",
                self.max
            )));
        }
        let dir = self.slot_dir(slot);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        self.leased.insert(slot);
        Ok(dir)
    }

    pub(crate) fn release(&mut self, dir: &Path) {
        let Some(slot) = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("rundir"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            return;
        };
        self.leased.remove(&slot);
    }

    pub(crate) fn leased(&self) -> usize {
        self.leased.len()
    }

    fn slot_dir(&self, slot: usize) -> PathBuf {
        self.base.join(format!("rundir{slot}"))
    }
}
