use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Name of the hidden state directory under the project root.
pub const STATE_DIR: &str = ".berth";

/// Top-level config.yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub verify_pipeline: Vec<String>,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub knowledge_graph: KnowledgeGraphConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-bead agent timeout in seconds. 0 means the 600s default.
    #[serde(default)]
    pub timeout_per_bead: i64,
    /// Consecutive-failure pause threshold. <=0 means the default of 3.
    #[serde(default)]
    pub circuit_breaker_threshold: i64,
    /// Prefix for worker and integration branches.
    #[serde(default)]
    pub branch_prefix: String,
    #[serde(default)]
    pub parallel_mode: ParallelMode,
    /// Concurrency cap for the scheduler. <=0 means the default of 5.
    #[serde(default)]
    pub max_parallel: i64,
    /// Minimum group size for `auto` parallel mode. <=0 means the default of 4.
    #[serde(default)]
    pub parallel_threshold: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    Never,
    #[default]
    Auto,
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Optional security command appended after the pipeline and bead extras.
    #[serde(default)]
    pub security: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraphConfig {
    #[serde(default)]
    pub enabled: GraphMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphMode {
    Never,
    #[default]
    Auto,
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Run directories older than this many days are pruned at run start.
    /// 0 disables pruning.
    #[serde(default)]
    pub max_age_days: i64,
}

impl Config {
    /// Load config from `.berth/config.yaml` under the project root.
    /// A missing file yields the defaults.
    pub fn load(project_root: &Path) -> anyhow::Result<Self> {
        let path = StatePaths::new(project_root).config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parse config from a YAML string.
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ExitError::Config(format!("invalid config.yaml: {e}")).into())
    }

    /// Effective per-bead timeout in seconds.
    pub fn timeout_per_bead(&self) -> u64 {
        if self.execution.timeout_per_bead <= 0 {
            600
        } else {
            self.execution.timeout_per_bead as u64
        }
    }

    /// Effective circuit-breaker threshold.
    pub fn breaker_threshold(&self) -> u32 {
        if self.execution.circuit_breaker_threshold <= 0 {
            3
        } else {
            self.execution.circuit_breaker_threshold as u32
        }
    }

    /// Effective branch prefix for worker and integration branches.
    pub fn branch_prefix(&self) -> &str {
        if self.execution.branch_prefix.is_empty() {
            "berth/"
        } else {
            &self.execution.branch_prefix
        }
    }

    /// Effective scheduler concurrency cap.
    pub fn max_parallel(&self) -> usize {
        if self.execution.max_parallel <= 0 {
            5
        } else {
            self.execution.max_parallel as usize
        }
    }

    /// Effective group-size threshold for `auto` parallel mode.
    pub fn parallel_threshold(&self) -> usize {
        if self.execution.parallel_threshold <= 0 {
            4
        } else {
            self.execution.parallel_threshold as usize
        }
    }
}

/// Filesystem layout of the hidden state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.join(STATE_DIR),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Generated executor system prompt.
    pub fn system_prompt_file(&self) -> PathBuf {
        self.root.join("CLAUDE.md")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn bead_meta_dir(&self) -> PathBuf {
        self.root.join("bead-meta")
    }

    pub fn event_log(&self) -> PathBuf {
        self.root.join("log.jsonl")
    }

    pub fn learnings_file(&self) -> PathBuf {
        self.root.join("learnings.md")
    }

    /// Create the state directory skeleton if missing.
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [
            self.root.clone(),
            self.runs_dir(),
            self.worktrees_dir(),
            self.bead_meta_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}
