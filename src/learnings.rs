//! Append-only learnings journal.
//!
//! One markdown bullet per completed bead. The accumulated text is embedded
//! into later prompts so workers inherit what earlier beads established.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Cap on how much accumulated text is fed back into prompts.
const PROMPT_BUDGET_BYTES: usize = 8 * 1024;

pub struct Learnings {
    path: PathBuf,
}

impl Learnings {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Append one learning line. Failures are warnings.
    pub fn append(&self, bead_id: &str, line: &str) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let entry = format!("- [{bead_id}] {}\n", line.trim());
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = result {
            tracing::warn!("failed to append learning: {e}");
        }
    }

    /// Read the accumulated learnings, newest-biased: when over budget the
    /// oldest lines are dropped.
    pub fn read_for_prompt(&self) -> String {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return String::new();
        };
        if contents.len() <= PROMPT_BUDGET_BYTES {
            return contents;
        }
        let mut kept: Vec<&str> = Vec::new();
        let mut size = 0;
        for line in contents.lines().rev() {
            size += line.len() + 1;
            if size > PROMPT_BUDGET_BYTES {
                break;
            }
            kept.push(line);
        }
        kept.reverse();
        kept.join("\n")
    }
}
