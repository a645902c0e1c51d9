// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Status, diff and staging against one repository root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::VcsError;

/// One entry of `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// The two-character XY status code, e.g. `" M"`, `"??"`, `"A "`.
    pub code: String,
    pub path: String,
    /// Present for renames (`R  old -> new`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

/// Parsed `git status` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub entries: Vec<StatusEntry>,
}

/// Handle on one repository root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Vcs {
    root: PathBuf,
}

impl Vcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `git status --porcelain`, parsed. An absent repository yields an
    /// empty status.
    pub async fn status(&self) -> Result<GitStatus, VcsError> {
        match self.run(&["status", "--porcelain", "--ignore-submodules"]).await {
            Ok(out) => Ok(GitStatus {
                entries: parse_status(&out),
            }),
            Err(VcsError::NotARepository(_)) => Ok(GitStatus::default()),
            Err(err) => Err(err),
        }
    }

    /// Unified diff of the working tree (or the index with `staged`),
    /// optionally narrowed to one path.
    pub async fn diff(&self, path: Option<&str>, staged: bool) -> Result<String, VcsError> {
        let mut args = vec!["diff", "--ignore-submodules"];
        if staged {
            args.push("--staged");
        }
        if let Some(p) = path {
            args.push("--");
            args.push(p);
        }
        self.run(&args).await
    }

    pub async fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    pub async fn unstage(&self, paths: &[String]) -> Result<(), VcsError> {
        let mut args = vec!["restore", "--staged", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    /// Cheap change fingerprint for the poll watcher: sorted porcelain
    /// status, unstaged diffstat, staged diffstat. Two identical
    /// fingerprints mean nothing observable changed.
    pub async fn fingerprint(&self) -> Result<String, VcsError> {
        let status = match self.run(&["status", "--porcelain", "--ignore-submodules"]).await {
            Ok(out) => out,
            Err(VcsError::NotARepository(_)) => return Ok(String::new()),
            Err(err) => return Err(err),
        };
        let unstaged = self.run(&["diff", "--stat", "--ignore-submodules"]).await?;
        let staged = self
            .run(&["diff", "--staged", "--stat", "--ignore-submodules"])
            .await?;
        Ok(compose_fingerprint(&status, &unstaged, &staged))
    }

    pub(crate) async fn run(&self, args: &[&str]) -> Result<String, VcsError> {
        debug!(root = %self.root.display(), ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(VcsError::Spawn)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not a git repository") {
                Err(VcsError::NotARepository(self.root.clone()))
            } else {
                Err(VcsError::Git {
                    command: args.join(" "),
                    stderr,
                })
            }
        }
    }
}

/// Parse `git status --porcelain` output.
pub(crate) fn parse_status(out: &str) -> Vec<StatusEntry> {
    out.lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_string();
            let rest = &line[3..];
            match rest.split_once(" -> ") {
                Some((from, to)) => StatusEntry {
                    code,
                    path: to.to_string(),
                    renamed_from: Some(from.to_string()),
                },
                None => StatusEntry {
                    code,
                    path: rest.to_string(),
                    renamed_from: None,
                },
            }
        })
        .collect()
}

/// Order-independent over status lines so that porcelain ordering quirks do
/// not register as changes.
pub(crate) fn compose_fingerprint(status: &str, unstaged: &str, staged: &str) -> String {
    let mut lines: Vec<&str> = status.lines().collect();
    lines.sort_unstable();
    format!("{}\n--\n{}\n--\n{}", lines.join("\n"), unstaged, staged)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
