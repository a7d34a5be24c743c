//! Berth - autonomous development-task orchestrator
//!
//! Drives atomic work items ("beads") through an execute → verify → commit
//! cycle performed by an external agent subprocess, recovers from
//! verification failures via a graduated escalation ladder, and optionally
//! runs independent beads in parallel on isolated worktrees, merging their
//! results serially onto a per-run integration branch.

pub mod agent;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod git;
pub mod knowledge;
pub mod learnings;
pub mod state;
pub mod subprocess;
pub mod tracker;
pub mod verify;
pub mod worktree;
