//! Per-bead isolated checkouts.
//!
//! Each worker gets a worktree at `.berth/worktrees/<bead-id>` rooted at a
//! fresh branch off the run's integration branch. The manager is safe for
//! concurrent use; the map of active checkouts is guarded by a mutex.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::git;

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
    branch_prefix: String,
    integration_branch: String,
    active: Mutex<BTreeMap<String, PathBuf>>,
}

impl WorktreeManager {
    pub fn new(
        repo_root: &Path,
        worktrees_dir: &Path,
        branch_prefix: &str,
        integration_branch: &str,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            branch_prefix: branch_prefix.to_string(),
            integration_branch: integration_branch.to_string(),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Worker branch name for a bead.
    pub fn branch_for(&self, bead_id: &str) -> String {
        format!("{}{bead_id}", self.branch_prefix)
    }

    /// Create the worktree for a bead, or return the existing path when one
    /// was already created for the same id.
    pub fn create(&self, bead_id: &str) -> anyhow::Result<PathBuf> {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(path) = active.get(bead_id) {
            return Ok(path.clone());
        }

        let path = self.worktrees_dir.join(bead_id);
        let branch = self.branch_for(bead_id);
        git::worktree_add(&self.repo_root, &path, &branch, &self.integration_branch)?;
        active.insert(bead_id.to_string(), path.clone());
        Ok(path)
    }

    /// Tear down a bead's checkout and best-effort delete its branch.
    pub fn remove(&self, bead_id: &str) -> anyhow::Result<()> {
        let path = {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            active.remove(bead_id)
        };
        let Some(path) = path else {
            return Ok(());
        };
        git::worktree_remove(&self.repo_root, &path)?;
        git::delete_branch(&self.repo_root, &self.branch_for(bead_id));
        Ok(())
    }

    /// Remove every tracked checkout.
    pub fn cleanup_all(&self) {
        let ids: Vec<String> = {
            let active = self
                .active
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            active.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.remove(&id) {
                tracing::warn!(bead = %id, "worktree cleanup failed: {e:#}");
            }
        }
    }
}
