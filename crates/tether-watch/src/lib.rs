// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Change watchers behind one subscription model.
//!
//! Four watcher kinds share the same surface: subscribe returns a stable,
//! kind-prefixed id; unsubscribe takes that id; a disconnecting client is
//! auto-unsubscribed by the RPC layer. A change notifies exactly the
//! subscriptions whose scope covers it, and any underlying resource (OS
//! file watch, poll timer) is released when its last subscription goes.
//!
//! | kind         | prefix | source                                     |
//! |--------------|--------|--------------------------------------------|
//! | filesystem   | `w_`   | OS file events, 100 ms debounce per path   |
//! | git          | `g_`   | 3 s poll, status+diffstat fingerprint      |
//! | worktree     | `wt_`  | 3 s poll of `git worktree list --porcelain`|
//! | session list | `sl_`  | store change feed (no polling)             |

mod fs;
mod git;
mod sessions;
mod subscription;
mod worktree;

pub use fs::FsWatcher;
pub use git::GitWatcher;
pub use sessions::SessionListWatcher;
pub use subscription::{new_subscription_id, Subscriber};
pub use worktree::WorktreeWatcher;

use thiserror::Error;

pub const FS_PREFIX: &str = "w_";
pub const GIT_PREFIX: &str = "g_";
pub const WORKTREE_PREFIX: &str = "wt_";
pub const SESSION_LIST_PREFIX: &str = "sl_";

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("unknown subscription {0}")]
    UnknownSubscription(String),

    #[error("filesystem watch failed: {0}")]
    Fs(#[from] notify::Error),
}
