// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session persistence and lifecycle.
//!
//! # Design
//!
//! ```text
//!   RPC handlers ──► SessionManager ──► AgentHandle (one per live id)
//!                         │                  │ events
//!                         │                  ▼
//!                         │            pump task: transcript append,
//!                         │            pending-request tracking,
//!                         │            chat subscriber fan-out
//!                         ▼
//!                   SessionStore: sessions/<id>/meta.yaml
//!                                 sessions/<id>/transcript.jsonl
//!                         │
//!                         └──► bounded change feed ──► session-list watcher
//! ```
//!
//! The manager enforces at-most-one live supervisor per session id and
//! appends every event to the transcript **before** fanning it out, so the
//! history reader, the store, and every live subscriber observe the same
//! linearizable order. Idle sessions are evicted after a configurable
//! quiet period; eviction closes the subprocess but preserves the
//! transcript.

mod manager;
mod store;

pub use manager::{ChatSnapshot, ChatSubscriber, SessionManager};
pub use store::{ChangeFeed, SessionListChange, SessionMeta, SessionStore, CHANGE_FEED_DEPTH};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("no pending request {0}")]
    RequestNotFound(String),

    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt metadata for session {id}: {source}")]
    Meta {
        id: String,
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Agent(#[from] tether_agent::AgentError),
}
