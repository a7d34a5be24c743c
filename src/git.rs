//! Git plumbing over the `git` CLI.
//!
//! All branch and merge mutations in the engine funnel through here. The
//! merge queue is the only caller allowed to touch the integration branch.

use std::path::Path;

use anyhow::Context;

use crate::subprocess::Cmd;

/// Outcome of a no-fast-forward merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge conflicted and was aborted; the target branch is clean.
    Conflict { detail: String },
}

fn git(repo: &Path, args: &[&str]) -> Cmd {
    Cmd::new("git").args(args).current_dir(repo)
}

pub fn is_repo(dir: &Path) -> bool {
    git(dir, &["rev-parse", "--git-dir"])
        .run()
        .map(|o| o.success())
        .unwrap_or(false)
}

/// Ensure HEAD points at a commit so branching is possible. Creates an empty
/// initial commit in a fresh repository.
pub fn ensure_initial_commit(repo: &Path) -> anyhow::Result<()> {
    if git(repo, &["rev-parse", "--verify", "HEAD"])
        .run()
        .map(|o| o.success())
        .unwrap_or(false)
    {
        return Ok(());
    }
    git(repo, &["commit", "--allow-empty", "-m", "initial commit"])
        .run_ok()
        .context("creating initial commit")?;
    Ok(())
}

pub fn current_branch(repo: &Path) -> anyhow::Result<String> {
    let output = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
        .run_ok()
        .context("reading current branch")?;
    Ok(output.stdout.trim().to_string())
}

pub fn branch_exists(repo: &Path, name: &str) -> bool {
    git(repo, &["rev-parse", "--verify", &format!("refs/heads/{name}")])
        .run()
        .map(|o| o.success())
        .unwrap_or(false)
}

/// Create a branch off HEAD.
pub fn create_branch(repo: &Path, name: &str) -> anyhow::Result<()> {
    git(repo, &["branch", name])
        .run_ok()
        .with_context(|| format!("creating branch {name}"))?;
    Ok(())
}

pub fn switch(repo: &Path, name: &str) -> anyhow::Result<()> {
    git(repo, &["checkout", name])
        .run_ok()
        .with_context(|| format!("switching to branch {name}"))?;
    Ok(())
}

/// Merge `branch` into the current branch with a no-fast-forward commit.
/// On conflict the merge is aborted so the current branch stays clean.
pub fn merge_no_ff(repo: &Path, branch: &str, message: &str) -> anyhow::Result<MergeOutcome> {
    let output = git(repo, &["merge", "--no-ff", "-m", message, branch])
        .run()
        .with_context(|| format!("merging {branch}"))?;
    if output.success() {
        return Ok(MergeOutcome::Merged);
    }

    let detail = output.combined().trim().to_string();
    let aborted = git(repo, &["merge", "--abort"])
        .run()
        .map(|o| o.success())
        .unwrap_or(false);
    if aborted || detail.contains("CONFLICT") {
        Ok(MergeOutcome::Conflict { detail })
    } else {
        anyhow::bail!("merge of {branch} failed: {detail}");
    }
}

/// Stage everything and commit. Returns false when there was nothing to
/// commit.
pub fn commit_all(repo: &Path, message: &str) -> anyhow::Result<bool> {
    git(repo, &["add", "-A"]).run_ok().context("staging changes")?;
    let output = git(repo, &["commit", "-m", message])
        .run()
        .context("committing")?;
    if output.success() {
        return Ok(true);
    }
    if output.combined().contains("nothing to commit") {
        return Ok(false);
    }
    anyhow::bail!("commit failed: {}", output.combined().trim());
}

/// Add a worktree at `path` on a new branch created off `start_point`.
pub fn worktree_add(
    repo: &Path,
    path: &Path,
    new_branch: &str,
    start_point: &str,
) -> anyhow::Result<()> {
    git(
        repo,
        &[
            "worktree",
            "add",
            "-b",
            new_branch,
            &path.display().to_string(),
            start_point,
        ],
    )
    .run_ok()
    .with_context(|| format!("adding worktree for {new_branch}"))?;
    Ok(())
}

pub fn worktree_remove(repo: &Path, path: &Path) -> anyhow::Result<()> {
    git(
        repo,
        &["worktree", "remove", "--force", &path.display().to_string()],
    )
    .run_ok()
    .with_context(|| format!("removing worktree {}", path.display()))?;
    Ok(())
}

/// Best-effort branch deletion. Fails silently when the branch is gone or
/// still checked out somewhere.
pub fn delete_branch(repo: &Path, name: &str) {
    let _ = git(repo, &["branch", "-D", name]).run();
}
