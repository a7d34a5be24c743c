//! Durable run state: the checkpoint envelope, written atomically after
//! every terminal bead event.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The Execution-State envelope persisted to `checkpoint.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    #[serde(default)]
    pub current_bead: String,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store rooted in a run directory.
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join("checkpoint.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full rewrite with a freshly stamped timestamp. The write goes to a
    /// temp file first and is renamed into place so a crash never leaves a
    /// torn checkpoint.
    pub fn save(&self, state: &mut ExecutionState) -> anyhow::Result<()> {
        state.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(state).context("encoding checkpoint")?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }

    /// Returns Ok(None) when no checkpoint exists (a first run). A present
    /// but unparseable file is an error the caller is expected to survive.
    pub fn load(&self) -> anyhow::Result<Option<ExecutionState>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading {}", self.path.display())));
            }
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Idempotent removal.
    pub fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("removing {}", self.path.display()))),
        }
    }
}
