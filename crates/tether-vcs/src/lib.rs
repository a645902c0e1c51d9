// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Thin async wrappers over the `git` binary.
//!
//! The control plane never links a VCS library; everything goes through the
//! installed `git`, the same one the assistant uses, so the two can never
//! disagree about repository state. Output parsing is limited to the stable
//! porcelain formats. A directory that is not a repository degrades to an
//! empty status rather than an error — the watchers poll unconditionally.

mod git;
mod worktree;

pub use git::{GitStatus, StatusEntry, Vcs};
pub use worktree::{Worktree, WorktreeList};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("{0} is not inside a git repository")]
    NotARepository(PathBuf),

    #[error("worktree {0} not found")]
    WorktreeNotFound(String),
}
