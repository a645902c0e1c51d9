// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Assistant subprocess supervision.
//!
//! # Design
//!
//! ```text
//!   client ──► AgentHandle::send_* ──► stdin (one JSON object + \n, mutex)
//!                                        │
//!                                     assistant
//!                                        │ stdout (line JSON)
//!   stdout reader ──► Translator ──► mpsc::Sender<AgentEvent> ──► consumer
//!   stderr drainer ──► oneshot ──► exit reporter ──► Error / ProcessEnded
//! ```
//!
//! One supervisor per session. Three cooperating tasks drain the subprocess:
//! the stdout reader feeds each line through the [`Translator`] and pushes
//! the resulting events into a bounded channel (a slow consumer
//! back-pressures the reader instead of ballooning memory); the stderr
//! drainer accumulates until EOF; the exit reporter waits for the child
//! after the reader finishes and turns an abnormal exit into an `Error`
//! event followed by `ProcessEnded`.
//!
//! Translation never fails: malformed lines degrade to `raw`/`text` events
//! and are logged, never propagated.

mod control;
mod supervisor;
mod translate;

pub use control::{
    new_request_id, PendingKind, PendingRequests, PermissionRequestData, QuestionRequestData,
};
pub use supervisor::{start, AgentConfig, AgentHandle, SpawnOptions};
pub use translate::Translator;

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the supervisor's write path and spawn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// The handle was closed; the write was not attempted.
    #[error("session is closed")]
    Closed,

    #[error("stdin write failed: {0}")]
    StdinWrite(std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
