// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Shared event vocabulary for the tether pipeline.
//!
//! Everything that flows between the assistant subprocess, the transcript
//! store, and a connected client is one [`AgentEvent`]. The enum is closed:
//! the translator produces exactly these variants, the store persists their
//! tagged-JSON form, and the RPC layer derives the notification payload from
//! the same shape. Consumers fold over the tag; there is no open field bag.

mod event;
mod sink;

pub use event::{
    AgentEvent, OutputStream, PermissionChoice, Question, QuestionOption, WARN_IMAGE_NOT_SUPPORTED,
    WARN_SCANNER_BUFFER_OVERFLOW, WARN_SCANNER_ERROR,
};
pub use sink::{Notification, NotificationSink, SinkClosed};

use serde::{Deserialize, Serialize};

/// Permission posture of a session, fixed for the lifetime of a live
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Tool uses require an explicit permission response from the client.
    #[default]
    Default,
    /// Skip permission prompts entirely.
    Yolo,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Default => "default",
            SessionMode::Yolo => "yolo",
        }
    }
}
