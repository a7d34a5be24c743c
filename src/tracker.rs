//! Bead model and the task-tracker collaborator client.
//!
//! Beads are tracked by the external `br` CLI. Sidecar metadata the tracker
//! has no fields for (affected files, extra verification commands) lives in
//! `.berth/bead-meta/<id>.json` and is merged on read.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::subprocess::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Done,
    Stuck,
    Skipped,
}

impl BeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Stuck => "stuck",
            Self::Skipped => "skipped",
        }
    }
}

/// An atomic work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: BeadStatus,
    #[serde(default, alias = "dependencies")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub verify_extra: Vec<String>,
}

fn default_status() -> BeadStatus {
    BeadStatus::Open
}

impl Bead {
    /// Ready iff open and every dependency is done.
    pub fn is_ready(&self, done: &BTreeSet<String>) -> bool {
        self.status == BeadStatus::Open && self.deps.iter().all(|d| done.contains(d))
    }
}

/// Sidecar metadata stored by the planner, keyed by bead id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarMeta {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub verify_extra: Vec<String>,
}

/// Client for the `br` tracker CLI plus the sidecar store.
pub struct Tracker {
    program: String,
    workdir: PathBuf,
    meta_dir: PathBuf,
}

impl Tracker {
    pub fn new(workdir: &Path, meta_dir: &Path) -> Self {
        Self {
            program: "br".to_string(),
            workdir: workdir.to_path_buf(),
            meta_dir: meta_dir.to_path_buf(),
        }
    }

    /// Override the tracker program. Used by tests to substitute a stub.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    /// All beads known to the tracker, sidecar-merged.
    pub fn all(&self) -> anyhow::Result<Vec<Bead>> {
        let output = Cmd::new(&self.program)
            .args(&["list", "--json"])
            .current_dir(&self.workdir)
            .run_ok()
            .context("listing beads")?;
        let mut beads = parse_bead_list(&output.stdout)?;
        for bead in &mut beads {
            self.merge_sidecar(bead);
        }
        Ok(beads)
    }

    /// Ready beads (open with all dependencies done), sidecar-merged.
    pub fn ready(&self) -> anyhow::Result<Vec<Bead>> {
        let output = Cmd::new(&self.program)
            .args(&["ready", "--json"])
            .current_dir(&self.workdir)
            .run_ok()
            .context("listing ready beads")?;
        let mut beads = parse_bead_list(&output.stdout)?;
        for bead in &mut beads {
            self.merge_sidecar(bead);
        }
        Ok(beads)
    }

    /// Best-effort status update. Tracker failures are warnings, not errors.
    pub fn set_status(&self, id: &str, status: BeadStatus) {
        let result = Cmd::new(&self.program)
            .args(&["update", id, "--status", status.as_str()])
            .current_dir(&self.workdir)
            .run_ok();
        if let Err(e) = result {
            tracing::warn!(bead = id, status = status.as_str(), "tracker update failed: {e:#}");
        }
    }

    /// Best-effort close with a reason.
    pub fn close(&self, id: &str, reason: &str) {
        let result = Cmd::new(&self.program)
            .args(&["close", id, "--reason", reason])
            .current_dir(&self.workdir)
            .run_ok();
        if let Err(e) = result {
            tracing::warn!(bead = id, "tracker close failed: {e:#}");
        }
    }

    /// Merge sidecar fields into a bead when the tracker left them empty.
    fn merge_sidecar(&self, bead: &mut Bead) {
        let Some(meta) = self.read_sidecar(&bead.id) else {
            return;
        };
        if bead.files.is_empty() {
            bead.files = meta.files;
        }
        if bead.verify_extra.is_empty() {
            bead.verify_extra = meta.verify_extra;
        }
    }

    pub fn read_sidecar(&self, id: &str) -> Option<SidecarMeta> {
        let path = self.meta_dir.join(format!("{id}.json"));
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(bead = id, "ignoring corrupt sidecar: {e}");
                None
            }
        }
    }

    pub fn write_sidecar(&self, id: &str, meta: &SidecarMeta) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.meta_dir)
            .with_context(|| format!("creating {}", self.meta_dir.display()))?;
        let path = self.meta_dir.join(format!("{id}.json"));
        let json = serde_json::to_string_pretty(meta).context("encoding sidecar")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
    }
}

/// Parse a bead list from tracker JSON: either a bare array or an object
/// wrapping one under "beads" or "issues".
fn parse_bead_list(json: &str) -> anyhow::Result<Vec<Bead>> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("parsing tracker JSON")?;
    let items = if let Some(arr) = value.as_array() {
        arr.clone()
    } else if let Some(arr) = value["beads"].as_array().or(value["issues"].as_array()) {
        arr.clone()
    } else {
        anyhow::bail!("tracker JSON is neither an array nor an object with beads");
    };

    items
        .into_iter()
        .map(|v| serde_json::from_value(v).context("parsing bead"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_array() {
        let beads = parse_bead_list(
            r#"[{"id":"bd-1","title":"one","status":"open","deps":["bd-0"]}]"#,
        )
        .unwrap();
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].id, "bd-1");
        assert_eq!(beads[0].deps, vec!["bd-0"]);
    }

    #[test]
    fn parse_wrapped_object() {
        let beads =
            parse_bead_list(r#"{"beads":[{"id":"bd-2","status":"in_progress"}]}"#).unwrap();
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].status, BeadStatus::InProgress);
    }

    #[test]
    fn parse_dependencies_alias() {
        let beads =
            parse_bead_list(r#"[{"id":"bd-3","dependencies":["bd-1","bd-2"]}]"#).unwrap();
        assert_eq!(beads[0].deps, vec!["bd-1", "bd-2"]);
    }

    #[test]
    fn parse_rejects_scalar() {
        assert!(parse_bead_list("42").is_err());
    }

    #[test]
    fn readiness_requires_done_deps() {
        let bead = Bead {
            id: "bd-9".to_string(),
            title: String::new(),
            description: String::new(),
            status: BeadStatus::Open,
            deps: vec!["bd-1".to_string(), "bd-2".to_string()],
            files: Vec::new(),
            verify_extra: Vec::new(),
        };
        let mut done = BTreeSet::new();
        done.insert("bd-1".to_string());
        assert!(!bead.is_ready(&done));
        done.insert("bd-2".to_string());
        assert!(bead.is_ready(&done));
    }

    #[test]
    fn in_progress_is_not_ready() {
        let bead = Bead {
            id: "bd-9".to_string(),
            title: String::new(),
            description: String::new(),
            status: BeadStatus::InProgress,
            deps: Vec::new(),
            files: Vec::new(),
            verify_extra: Vec::new(),
        };
        assert!(!bead.is_ready(&BTreeSet::new()));
    }

    #[test]
    fn sidecar_round_trip_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::new(dir.path(), &dir.path().join("bead-meta"));

        let meta = SidecarMeta {
            files: vec!["src/a.rs".to_string()],
            verify_extra: vec!["just e2e".to_string()],
        };
        tracker.write_sidecar("bd-1", &meta).unwrap();

        let mut bead = Bead {
            id: "bd-1".to_string(),
            title: String::new(),
            description: String::new(),
            status: BeadStatus::Open,
            deps: Vec::new(),
            files: Vec::new(),
            verify_extra: Vec::new(),
        };
        tracker.merge_sidecar(&mut bead);
        assert_eq!(bead.files, vec!["src/a.rs"]);
        assert_eq!(bead.verify_extra, vec!["just e2e"]);
    }

    #[test]
    fn sidecar_does_not_override_tracker_fields() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::new(dir.path(), &dir.path().join("bead-meta"));
        tracker
            .write_sidecar(
                "bd-2",
                &SidecarMeta {
                    files: vec!["sidecar.rs".to_string()],
                    verify_extra: Vec::new(),
                },
            )
            .unwrap();

        let mut bead = Bead {
            id: "bd-2".to_string(),
            title: String::new(),
            description: String::new(),
            status: BeadStatus::Open,
            deps: Vec::new(),
            files: vec!["tracker.rs".to_string()],
            verify_extra: Vec::new(),
        };
        tracker.merge_sidecar(&mut bead);
        assert_eq!(bead.files, vec!["tracker.rs"]);
    }

    #[test]
    fn corrupt_sidecar_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let meta_dir = dir.path().join("bead-meta");
        std::fs::create_dir_all(&meta_dir).unwrap();
        std::fs::write(meta_dir.join("bd-3.json"), "{ not json").unwrap();

        let tracker = Tracker::new(dir.path(), &meta_dir);
        assert!(tracker.read_sidecar("bd-3").is_none());
    }
}
