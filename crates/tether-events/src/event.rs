// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The closed event union.
//!
//! Each variant has exactly one persisted shape (the serde-tagged record
//! written to the transcript) and exactly one notification shape (the
//! `chat.<type>` JSON-RPC notification). The two differ only by the
//! `session_id` / `subscription_id` fields added to the notification — the
//! record fields themselves are identical, so replaying a transcript yields
//! the same sequence a live subscriber saw.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sink::Notification;

/// Warning code for a `tool_result` whose content is an image block.
pub const WARN_IMAGE_NOT_SUPPORTED: &str = "image_not_supported";
/// Warning code for an I/O error on the assistant's stdout scanner.
pub const WARN_SCANNER_ERROR: &str = "scanner_error";
/// Warning code for a stdout line exceeding the scanner's buffer limit.
pub const WARN_SCANNER_BUFFER_OVERFLOW: &str = "scanner_buffer_overflow";

/// One atomic observation produced by a session.
///
/// The first group of variants is produced by the translator from the
/// assistant's stdout; `Message`, `PermissionResponse` and
/// `QuestionResponse` are transcript-only records of what the user sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant prose. Contiguous text blocks are accumulated into one.
    Text { text: String },

    /// The assistant invoked a tool.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },

    /// Result of an earlier tool call, correlated by tool-use id.
    ToolResult { id: String, content: String },

    /// A non-fatal problem the client should surface.
    Warning { message: String, code: String },

    /// A fatal problem for this session (e.g. abnormal subprocess exit).
    Error { message: String },

    /// The assistant finished the current turn.
    Done,

    /// The current turn was interrupted.
    Interrupted,

    /// The assistant asks whether it may use a tool.
    PermissionRequest {
        request_id: String,
        tool_use_id: String,
        tool_name: String,
        input: Value,
        /// Permission updates the assistant suggests for "always allow".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggestions: Option<Value>,
    },

    /// The assistant asks the user one or more questions.
    AskUserQuestion {
        request_id: String,
        tool_use_id: String,
        questions: Vec<Question>,
    },

    /// The assistant withdrew a pending control request.
    RequestCancelled { request_id: String },

    /// A system line from the assistant (init lines are swallowed upstream).
    System { content: String },

    /// The subprocess is gone. Always the last event of a session run.
    ProcessEnded,

    /// Output of a local command echoed through the assistant transcript.
    CommandOutput {
        stream: OutputStream,
        content: String,
    },

    /// A line the translator recognized as JSON but not as any known type.
    Raw { line: String },

    /// Transcript-only: the user's prompt as sent.
    Message { content: String },

    /// Transcript-only: the user's answer to a permission request.
    PermissionResponse {
        request_id: String,
        choice: PermissionChoice,
    },

    /// Transcript-only: the user's answers to a question request.
    /// `answers: None` records a cancellation.
    QuestionResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answers: Option<Vec<String>>,
    },
}

/// Which stream a [`AgentEvent::CommandOutput`] span came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The user's verdict on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    Allow,
    AlwaysAllow,
    Deny,
}

/// One question inside an [`AgentEvent::AskUserQuestion`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// A selectable answer to a [`Question`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AgentEvent {
    /// The snake_case tag, identical to the `type` field of the record and
    /// to the suffix of the notification method.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Text { .. } => "text",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Warning { .. } => "warning",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Done => "done",
            AgentEvent::Interrupted => "interrupted",
            AgentEvent::PermissionRequest { .. } => "permission_request",
            AgentEvent::AskUserQuestion { .. } => "ask_user_question",
            AgentEvent::RequestCancelled { .. } => "request_cancelled",
            AgentEvent::System { .. } => "system",
            AgentEvent::ProcessEnded => "process_ended",
            AgentEvent::CommandOutput { .. } => "command_output",
            AgentEvent::Raw { .. } => "raw",
            AgentEvent::Message { .. } => "message",
            AgentEvent::PermissionResponse { .. } => "permission_response",
            AgentEvent::QuestionResponse { .. } => "question_response",
        }
    }

    /// True for the events that end a turn: `done`, `interrupted`,
    /// `process_ended`. The session manager uses this for idle accounting.
    pub fn ends_turn(&self) -> bool {
        matches!(
            self,
            AgentEvent::Done | AgentEvent::Interrupted | AgentEvent::ProcessEnded
        )
    }

    /// The persisted record: a tagged JSON object with a `type` field.
    pub fn to_record(&self) -> Value {
        // Serialization of this enum cannot fail: every payload is already
        // a JSON-compatible value.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a persisted record back into an event.
    pub fn from_record(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The notification shape: method `chat.<type>`, params = record fields
    /// plus `session_id` and `subscription_id`.
    pub fn notification(&self, session_id: &str, subscription_id: &str) -> Notification {
        let mut params = self.to_record();
        if let Value::Object(ref mut map) = params {
            map.remove("type");
            map.insert("session_id".into(), Value::String(session_id.to_string()));
            map.insert(
                "subscription_id".into(),
                Value::String(subscription_id.to_string()),
            );
        }
        Notification {
            method: format!("chat.{}", self.kind()),
            params,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(ev: AgentEvent) {
        let record = ev.to_record();
        let back = AgentEvent::from_record(record.clone())
            .unwrap_or_else(|e| panic!("record {record} must parse: {e}"));
        assert_eq!(back, ev);
    }

    #[test]
    fn every_record_shape_round_trips() {
        round_trip(AgentEvent::Text {
            text: "hello".into(),
        });
        round_trip(AgentEvent::ToolCall {
            id: "t1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        });
        round_trip(AgentEvent::ToolResult {
            id: "t1".into(),
            content: "a.txt\nb.txt".into(),
        });
        round_trip(AgentEvent::Warning {
            message: "image content".into(),
            code: WARN_IMAGE_NOT_SUPPORTED.into(),
        });
        round_trip(AgentEvent::Error {
            message: "exit status 1".into(),
        });
        round_trip(AgentEvent::Done);
        round_trip(AgentEvent::Interrupted);
        round_trip(AgentEvent::PermissionRequest {
            request_id: "r1".into(),
            tool_use_id: "t1".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
            suggestions: Some(json!([{"type": "addRules"}])),
        });
        round_trip(AgentEvent::AskUserQuestion {
            request_id: "r2".into(),
            tool_use_id: "t2".into(),
            questions: vec![Question {
                question: "Which color?".into(),
                header: Some("Theme".into()),
                options: vec![QuestionOption {
                    label: "blue".into(),
                    description: None,
                }],
                multi_select: false,
            }],
        });
        round_trip(AgentEvent::RequestCancelled {
            request_id: "r1".into(),
        });
        round_trip(AgentEvent::System {
            content: "{\"type\":\"system\"}".into(),
        });
        round_trip(AgentEvent::ProcessEnded);
        round_trip(AgentEvent::CommandOutput {
            stream: OutputStream::Stdout,
            content: "ok".into(),
        });
        round_trip(AgentEvent::Raw {
            line: "{\"type\":\"mystery\"}".into(),
        });
        round_trip(AgentEvent::Message {
            content: "Reply with exactly: OK".into(),
        });
        round_trip(AgentEvent::PermissionResponse {
            request_id: "r1".into(),
            choice: PermissionChoice::Allow,
        });
        round_trip(AgentEvent::QuestionResponse {
            request_id: "r2".into(),
            answers: Some(vec!["blue".into()]),
        });
        round_trip(AgentEvent::QuestionResponse {
            request_id: "r2".into(),
            answers: None,
        });
    }

    #[test]
    fn record_tag_matches_kind() {
        let ev = AgentEvent::ToolCall {
            id: "t1".into(),
            name: "Bash".into(),
            input: json!({}),
        };
        assert_eq!(ev.to_record()["type"], "tool_call");
        assert_eq!(ev.kind(), "tool_call");
    }

    #[test]
    fn notification_carries_session_and_subscription_ids() {
        let ev = AgentEvent::Text {
            text: "OK".into(),
        };
        let n = ev.notification("s1", "c_abc");
        assert_eq!(n.method, "chat.text");
        assert_eq!(n.params["text"], "OK");
        assert_eq!(n.params["session_id"], "s1");
        assert_eq!(n.params["subscription_id"], "c_abc");
        assert!(n.params.get("type").is_none(), "tag lives in the method");
    }

    #[test]
    fn permission_choice_serializes_snake_case() {
        let s = serde_json::to_string(&PermissionChoice::AlwaysAllow).unwrap();
        assert_eq!(s, "\"always_allow\"");
    }

    #[test]
    fn turn_ending_events() {
        assert!(AgentEvent::Done.ends_turn());
        assert!(AgentEvent::Interrupted.ends_turn());
        assert!(AgentEvent::ProcessEnded.ends_turn());
        assert!(!AgentEvent::Text { text: "x".into() }.ends_turn());
    }

    #[test]
    fn folding_tool_call_and_result_pairs_by_id() {
        // A client reconstructing state by folding events must arrive at the
        // same {call, result} pair regardless of intervening text events.
        let events = vec![
            AgentEvent::ToolCall {
                id: "t1".into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            },
            AgentEvent::Text {
                text: "running".into(),
            },
            AgentEvent::Text {
                text: "still running".into(),
            },
            AgentEvent::ToolResult {
                id: "t1".into(),
                content: "a.txt".into(),
            },
        ];
        let mut call = None;
        let mut result = None;
        for ev in &events {
            match ev {
                AgentEvent::ToolCall { id, .. } => call = Some(id.clone()),
                AgentEvent::ToolResult { id, content } if Some(id) == call.as_ref() => {
                    result = Some(content.clone())
                }
                _ => {}
            }
        }
        assert_eq!(call.as_deref(), Some("t1"));
        assert_eq!(result.as_deref(), Some("a.txt"));
    }
}
