//! Coordination state shared by parallel workers.
//!
//! All mutation happens under the coordinator's single reader/writer lock;
//! the methods here take `&mut self` and leave locking to the server.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// An advisory file lock owned by one bead.
#[derive(Debug, Clone)]
pub struct FileLock {
    pub bead_id: String,
    pub path: String,
    pub acquired_at: Instant,
    pub last_heartbeat: Instant,
}

/// A recorded design decision, shared across workers.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub bead_id: String,
    pub key: String,
    pub value: String,
    pub rationale: String,
    pub tags: Vec<String>,
    pub time: String,
}

/// A declared intent to modify files.
#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub bead_id: String,
    pub action: String,
    pub description: String,
    pub files: Vec<String>,
    pub time: String,
}

/// A published artifact other workers may consume.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub bead_id: String,
    pub name: String,
    pub path: String,
    pub exports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AcquireResult {
    pub acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Default)]
pub struct CoordState {
    locks: BTreeMap<String, FileLock>,
    decisions: Vec<Decision>,
    intents: BTreeMap<String, Intent>,
    artifacts: Vec<Artifact>,
    statuses: BTreeMap<String, String>,
    heartbeats: BTreeMap<String, Instant>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl CoordState {
    /// Acquire a lock on a path. Re-acquisition by the current owner is
    /// idempotent success and refreshes the heartbeat.
    pub fn acquire_lock(&mut self, bead_id: &str, path: &str) -> AcquireResult {
        if let Some(lock) = self.locks.get_mut(path) {
            if lock.bead_id == bead_id {
                lock.last_heartbeat = Instant::now();
                return AcquireResult {
                    acquired: true,
                    blocked_by: None,
                };
            }
            return AcquireResult {
                acquired: false,
                blocked_by: Some(lock.bead_id.clone()),
            };
        }
        let now = Instant::now();
        self.locks.insert(
            path.to_string(),
            FileLock {
                bead_id: bead_id.to_string(),
                path: path.to_string(),
                acquired_at: now,
                last_heartbeat: now,
            },
        );
        AcquireResult {
            acquired: true,
            blocked_by: None,
        }
    }

    /// Release a lock. Only the owner may release; anything else is a no-op
    /// reported as not-released.
    pub fn release_lock(&mut self, bead_id: &str, path: &str) -> bool {
        match self.locks.get(path) {
            Some(lock) if lock.bead_id == bead_id => {
                self.locks.remove(path);
                true
            }
            _ => false,
        }
    }

    pub fn check_lock(&self, path: &str) -> (bool, Option<String>) {
        self.locks
            .get(path)
            .map_or((false, None), |l| (true, Some(l.bead_id.clone())))
    }

    /// Touch the bead's heartbeat record and refresh every lock it owns.
    /// A heartbeat from a bead holding no locks is still recorded.
    pub fn heartbeat(&mut self, bead_id: &str) {
        let now = Instant::now();
        self.heartbeats.insert(bead_id.to_string(), now);
        for lock in self.locks.values_mut() {
            if lock.bead_id == bead_id {
                lock.last_heartbeat = now;
            }
        }
    }

    pub fn write_decision(
        &mut self,
        bead_id: &str,
        key: &str,
        value: &str,
        rationale: &str,
        tags: Vec<String>,
    ) {
        self.decisions.push(Decision {
            bead_id: bead_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            rationale: rationale.to_string(),
            tags,
            time: now_rfc3339(),
        });
    }

    pub fn read_decisions(&self, tag: Option<&str>) -> Vec<Decision> {
        match tag {
            None => self.decisions.clone(),
            Some(tag) => self
                .decisions
                .iter()
                .filter(|d| d.tags.iter().any(|t| t == tag))
                .cloned()
                .collect(),
        }
    }

    /// Record an intent and report conflicts against other active intents
    /// and against existing locks. The intent is recorded even when it
    /// conflicts, so the asking agent can see and negotiate.
    pub fn announce_intent(
        &mut self,
        bead_id: &str,
        action: &str,
        description: &str,
        files: Vec<String>,
    ) -> (Vec<String>, Vec<Decision>) {
        let mut conflicts = Vec::new();
        for file in &files {
            for (other_id, intent) in &self.intents {
                if other_id != bead_id && intent.files.contains(file) {
                    conflicts.push(format!("{file} is targeted by {other_id} ({})", intent.action));
                }
            }
            if let Some(lock) = self.locks.get(file) {
                if lock.bead_id != bead_id {
                    conflicts.push(format!("{file} is locked by {}", lock.bead_id));
                }
            }
        }

        self.intents.insert(
            bead_id.to_string(),
            Intent {
                bead_id: bead_id.to_string(),
                action: action.to_string(),
                description: description.to_string(),
                files,
                time: now_rfc3339(),
            },
        );

        (conflicts, self.decisions.clone())
    }

    pub fn publish_artifact(
        &mut self,
        bead_id: &str,
        name: &str,
        path: &str,
        exports: Vec<String>,
    ) {
        self.artifacts.push(Artifact {
            bead_id: bead_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            exports,
        });
    }

    pub fn query_artifacts(&self, name: Option<&str>) -> Vec<Artifact> {
        match name {
            None => self.artifacts.clone(),
            Some(name) => self
                .artifacts
                .iter()
                .filter(|a| a.name == name)
                .cloned()
                .collect(),
        }
    }

    pub fn report_status(&mut self, bead_id: &str, status: &str) {
        self.statuses.insert(bead_id.to_string(), status.to_string());
    }

    pub fn all_statuses(&self) -> BTreeMap<String, String> {
        self.statuses.clone()
    }

    /// Delete locks whose last heartbeat is older than `max_age`. Returns
    /// the reaped paths.
    pub fn reap_stale_locks(&mut self, max_age: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.last_heartbeat.elapsed() > max_age)
            .map(|l| l.path.clone())
            .collect();
        for path in &stale {
            self.locks.remove(path);
        }
        stale
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
