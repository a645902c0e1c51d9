// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Worktree management on top of `git worktree … --porcelain`.
//!
//! A worktree is addressed by its directory name; the main checkout is the
//! first entry git reports and is never listed under that name — clients
//! bind to it with the empty string.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{git::Vcs, VcsError};

/// One linked worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

/// Snapshot of `git worktree list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeList {
    /// The main checkout path.
    pub main: PathBuf,
    /// Linked worktrees, in git's listing order.
    pub linked: Vec<Worktree>,
}

impl WorktreeList {
    pub fn find(&self, name: &str) -> Option<&Worktree> {
        self.linked.iter().find(|w| w.name == name)
    }
}

impl Vcs {
    /// List worktrees. An absent repository yields an empty list rooted at
    /// the configured directory.
    pub async fn worktrees(&self) -> Result<WorktreeList, VcsError> {
        match self.run(&["worktree", "list", "--porcelain"]).await {
            Ok(out) => Ok(parse_worktrees(&out)),
            Err(VcsError::NotARepository(_)) => Ok(WorktreeList {
                main: self.root().to_path_buf(),
                linked: Vec::new(),
            }),
            Err(err) => Err(err),
        }
    }

    /// The raw porcelain listing, used by the poll watcher for change
    /// detection.
    pub async fn worktree_listing(&self) -> Result<String, VcsError> {
        match self.run(&["worktree", "list", "--porcelain"]).await {
            Ok(out) => Ok(out),
            Err(VcsError::NotARepository(_)) => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// Create a worktree named `name` at `dir`, on a new branch of the same
    /// name.
    pub async fn worktree_create(&self, name: &str, dir: &Path) -> Result<Worktree, VcsError> {
        let dir_str = dir.to_string_lossy().into_owned();
        self.run(&["worktree", "add", "-b", name, &dir_str]).await?;
        Ok(Worktree {
            name: name.to_string(),
            path: dir.to_path_buf(),
            branch: Some(name.to_string()),
            head: None,
        })
    }

    /// Remove the worktree named `name`.
    pub async fn worktree_delete(&self, name: &str) -> Result<(), VcsError> {
        let list = self.worktrees().await?;
        let wt = list
            .find(name)
            .ok_or_else(|| VcsError::WorktreeNotFound(name.to_string()))?;
        let path = wt.path.to_string_lossy().into_owned();
        self.run(&["worktree", "remove", "--force", &path])
            .await
            .map(|_| ())
    }
}

/// Parse `git worktree list --porcelain`: stanzas separated by blank lines,
/// each starting with a `worktree <path>` line.
pub(crate) fn parse_worktrees(out: &str) -> WorktreeList {
    let mut main = PathBuf::new();
    let mut linked = Vec::new();

    for (idx, stanza) in out.split("\n\n").enumerate() {
        let mut path = None;
        let mut head = None;
        let mut branch = None;
        for line in stanza.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = Some(h.to_string());
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.trim_start_matches("refs/heads/").to_string());
            }
        }
        let Some(path) = path else { continue };
        if idx == 0 {
            main = path;
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            linked.push(Worktree {
                name,
                path,
                branch,
                head,
            });
        }
    }

    WorktreeList { main, linked }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
