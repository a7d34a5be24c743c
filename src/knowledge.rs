//! Knowledge-graph collaborator client.
//!
//! Thin wrapper over the `kg` CLI: impact queries feed the reconciler and
//! prompt context; reindex requests keep the graph current after merges.
//! All failures degrade to empty data with a warning.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::GraphMode;
use crate::subprocess::Cmd;

/// Impact data for a set of files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImpactData {
    #[serde(default)]
    pub direct_dependents: Vec<String>,
    #[serde(default)]
    pub transitive_dependents: Vec<String>,
    #[serde(default)]
    pub affected_tests: Vec<String>,
}

impl ImpactData {
    pub fn is_empty(&self) -> bool {
        self.direct_dependents.is_empty()
            && self.transitive_dependents.is_empty()
            && self.affected_tests.is_empty()
    }
}

pub struct KnowledgeGraph {
    program: String,
    workdir: PathBuf,
    enabled: bool,
}

impl KnowledgeGraph {
    pub fn new(workdir: &Path, mode: GraphMode) -> Self {
        let enabled = match mode {
            GraphMode::Never => false,
            // `auto` enables the client only when the CLI is reachable.
            GraphMode::Auto => Cmd::new("kg")
                .arg("--version")
                .run()
                .map(|o| o.success())
                .unwrap_or(false),
            GraphMode::Always => true,
        };
        Self {
            program: "kg".to_string(),
            workdir: workdir.to_path_buf(),
            enabled,
        }
    }

    /// Override the program. Used by tests to substitute a stub.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self.enabled = true;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Impact of changing the given files. Disabled or failing queries
    /// return empty data.
    pub fn impact(&self, files: &[String]) -> ImpactData {
        if !self.enabled || files.is_empty() {
            return ImpactData::default();
        }
        let mut args = vec!["impact", "--json"];
        args.extend(files.iter().map(String::as_str));
        let output = match Cmd::new(&self.program)
            .args(&args)
            .current_dir(&self.workdir)
            .run()
        {
            Ok(o) if o.success() => o,
            Ok(o) => {
                tracing::warn!("kg impact failed: {}", o.stderr.trim());
                return ImpactData::default();
            }
            Err(e) => {
                tracing::warn!("kg impact failed: {e:#}");
                return ImpactData::default();
            }
        };
        match output.parse_json() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("kg impact returned unparseable JSON: {e:#}");
                ImpactData::default()
            }
        }
    }

    /// Best-effort reindex request after a merge.
    pub fn reindex(&self, files: &[String]) {
        if !self.enabled || files.is_empty() {
            return;
        }
        let mut args = vec!["reindex"];
        args.extend(files.iter().map(String::as_str));
        let result = Cmd::new(&self.program)
            .args(&args)
            .current_dir(&self.workdir)
            .run();
        match result {
            Ok(o) if o.success() => {}
            Ok(o) => tracing::warn!("kg reindex failed: {}", o.stderr.trim()),
            Err(e) => tracing::warn!("kg reindex failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stub-kg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn never_mode_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let graph = KnowledgeGraph::new(dir.path(), GraphMode::Never);
        assert!(!graph.is_enabled());
        assert!(graph.impact(&["a.rs".to_string()]).is_empty());
    }

    #[test]
    fn impact_parses_stub_json() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"direct_dependents":["b.rs"],"transitive_dependents":["c.rs"],"affected_tests":["tests/b.rs"]}'"#,
        );
        let graph = KnowledgeGraph::new(dir.path(), GraphMode::Never)
            .with_program(&stub.display().to_string());
        let impact = graph.impact(&["a.rs".to_string()]);
        assert_eq!(impact.direct_dependents, vec!["b.rs"]);
        assert_eq!(impact.transitive_dependents, vec!["c.rs"]);
        assert_eq!(impact.affected_tests, vec!["tests/b.rs"]);
    }

    #[test]
    fn failing_stub_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "exit 1");
        let graph = KnowledgeGraph::new(dir.path(), GraphMode::Never)
            .with_program(&stub.display().to_string());
        assert!(graph.impact(&["a.rs".to_string()]).is_empty());
    }

    #[test]
    fn empty_file_list_skips_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let graph = KnowledgeGraph::new(dir.path(), GraphMode::Never)
            .with_program("nonexistent-kg-xyz");
        assert!(graph.impact(&[]).is_empty());
        graph.reindex(&[]);
    }
}
