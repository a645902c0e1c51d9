// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Line-JSON translation: one assistant stdout line in, zero or more
//! [`AgentEvent`]s out.
//!
//! Translation is total. A line that is not JSON becomes a `text` event; a
//! JSON object of unknown type becomes a `raw` event; malformed
//! substructures degrade rather than error. The translator owns the small
//! amount of state the dialect requires: the pending-control-request map
//! (interrupt correlation and echo suppression) and the native session id
//! captured from the `system`/`init` line.
//!
//! Interrupt delivery is exactly-once per turn, preferring the
//! control-response correlation: once an interrupt has been emitted for
//! the current turn, the `result`-derived abort marker is swallowed.

use serde_json::Value;
use tracing::debug;

use tether_events::{
    AgentEvent, OutputStream, Question, QuestionOption, WARN_IMAGE_NOT_SUPPORTED,
};

use crate::control::{PendingKind, PendingRequests};

const STDOUT_OPEN: &str = "<local-command-stdout>";
const STDOUT_CLOSE: &str = "</local-command-stdout>";
const STDERR_OPEN: &str = "<local-command-stderr>";
const STDERR_CLOSE: &str = "</local-command-stderr>";

/// Stateful translator for one session's stdout.
#[derive(Debug, Clone, Default)]
pub struct Translator {
    pending: PendingRequests,
    native_session_id: Option<String>,
    /// An `Interrupted` was already emitted for the current turn.
    interrupted: bool,
}

impl Translator {
    pub fn new(pending: PendingRequests) -> Self {
        Self {
            pending,
            native_session_id: None,
            interrupted: false,
        }
    }

    /// The assistant's own session id, once the init line has been seen.
    pub fn native_session_id(&self) -> Option<&str> {
        self.native_session_id.as_deref()
    }

    /// Translate one stdout line. Never fails; may return no events.
    pub fn translate_line(&mut self, line: &str) -> Vec<AgentEvent> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                // Degrade, never block: surface the line as plain text.
                debug!("non-JSON assistant line: {err}");
                return vec![AgentEvent::Text {
                    text: line.to_string(),
                }];
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("system") => self.on_system(&value, line),
            Some("assistant") => self.on_assistant(&value, line),
            Some("user") => self.on_user(&value),
            Some("result") => self.on_result(&value),
            Some("control_request") => self.on_control_request(&value),
            Some("control_response") => self.on_control_response(&value),
            Some("control_cancel_request") => {
                let request_id = str_field(&value, "request_id");
                vec![AgentEvent::RequestCancelled { request_id }]
            }
            Some("progress") => Vec::new(),
            _ => vec![AgentEvent::Raw {
                line: line.to_string(),
            }],
        }
    }

    fn on_system(&mut self, value: &Value, line: &str) -> Vec<AgentEvent> {
        if value.get("subtype").and_then(Value::as_str) == Some("init") {
            if self.native_session_id.is_none() {
                self.native_session_id = value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            return Vec::new();
        }
        vec![AgentEvent::System {
            content: line.to_string(),
        }]
    }

    fn on_assistant(&mut self, value: &Value, line: &str) -> Vec<AgentEvent> {
        let Some(blocks) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            return vec![AgentEvent::Raw {
                line: line.to_string(),
            }];
        };

        let mut events = Vec::new();
        let mut text = String::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") | Some("server_tool_use") => {
                    flush_text(&mut text, &mut events);
                    events.push(AgentEvent::ToolCall {
                        id: str_field(block, "id"),
                        name: str_field(block, "name"),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
        flush_text(&mut text, &mut events);
        events
    }

    fn on_user(&mut self, value: &Value) -> Vec<AgentEvent> {
        let content = value.get("message").and_then(|m| m.get("content"));
        match content {
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
                .filter_map(tool_result_event)
                .collect(),
            Some(Value::String(text)) => command_output_events(text),
            _ => Vec::new(),
        }
    }

    fn on_result(&mut self, value: &Value) -> Vec<AgentEvent> {
        let aborted = value.get("subtype").and_then(Value::as_str)
            == Some("error_during_execution")
            && error_strings(value)
                .iter()
                .any(|s| s.contains("Request was aborted"));

        if aborted {
            if self.interrupted {
                // The control-response correlation already reported this
                // interrupt; the turn is over either way.
                self.interrupted = false;
                return Vec::new();
            }
            return vec![AgentEvent::Interrupted];
        }
        self.interrupted = false;
        vec![AgentEvent::Done]
    }

    fn on_control_request(&mut self, value: &Value) -> Vec<AgentEvent> {
        let request_id = str_field(value, "request_id");
        let Some(request) = value.get("request") else {
            return Vec::new();
        };
        if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
            let subtype = request.get("subtype").and_then(Value::as_str);
            debug!(subtype, "ignoring control request");
            return Vec::new();
        }

        let tool_name = str_field(request, "tool_name");
        let tool_use_id = str_field(request, "tool_use_id");
        let input = request.get("input").cloned().unwrap_or(Value::Null);

        if tool_name == "AskUserQuestion" {
            let questions = input
                .get("questions")
                .and_then(Value::as_array)
                .map(|qs| qs.iter().map(parse_question).collect())
                .unwrap_or_default();
            return vec![AgentEvent::AskUserQuestion {
                request_id,
                tool_use_id,
                questions,
            }];
        }

        vec![AgentEvent::PermissionRequest {
            request_id,
            tool_use_id,
            tool_name,
            input,
            suggestions: request.get("permission_suggestions").cloned(),
        }]
    }

    fn on_control_response(&mut self, value: &Value) -> Vec<AgentEvent> {
        let request_id = value
            .get("response")
            .and_then(|r| r.get("request_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match self.pending.resolve(request_id) {
            Some(PendingKind::Interrupt) => {
                self.interrupted = true;
                vec![AgentEvent::Interrupted]
            }
            Some(PendingKind::Sent) => Vec::new(),
            None => {
                debug!(%request_id, "control response with no pending entry");
                Vec::new()
            }
        }
    }
}

fn flush_text(text: &mut String, events: &mut Vec<AgentEvent>) {
    if !text.is_empty() {
        events.push(AgentEvent::Text {
            text: std::mem::take(text),
        });
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// One `tool_result` block → `ToolResult`, or a `Warning` when the content
/// is an image block array (the wire cannot carry images to the client).
fn tool_result_event(block: &Value) -> Option<AgentEvent> {
    let id = str_field(block, "tool_use_id");
    match block.get("content") {
        Some(Value::Array(items))
            if items
                .iter()
                .any(|i| i.get("type").and_then(Value::as_str) == Some("image")) =>
        {
            Some(AgentEvent::Warning {
                message: format!("tool result for {id} contained an image"),
                code: WARN_IMAGE_NOT_SUPPORTED.to_string(),
            })
        }
        Some(Value::String(content)) => Some(AgentEvent::ToolResult {
            id,
            content: content.clone(),
        }),
        Some(other) => Some(AgentEvent::ToolResult {
            id,
            content: other.to_string(),
        }),
        None => Some(AgentEvent::ToolResult {
            id,
            content: String::new(),
        }),
    }
}

/// Extract `<local-command-stdout>` / `<local-command-stderr>` spans from a
/// plain-string user message. Content outside the tags is discarded.
fn command_output_events(text: &str) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    collect_spans(text, STDOUT_OPEN, STDOUT_CLOSE, OutputStream::Stdout, &mut events);
    collect_spans(text, STDERR_OPEN, STDERR_CLOSE, OutputStream::Stderr, &mut events);
    events
}

fn collect_spans(
    text: &str,
    open: &str,
    close: &str,
    stream: OutputStream,
    events: &mut Vec<AgentEvent>,
) {
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(close) else { break };
        events.push(AgentEvent::CommandOutput {
            stream,
            content: after[..end].to_string(),
        });
        rest = &after[end + close.len()..];
    }
}

/// Lenient question parse: a plain string degrades to an option-less
/// question; both `multiSelect` and `multi_select` spellings are accepted.
fn parse_question(value: &Value) -> Question {
    if let Some(s) = value.as_str() {
        return Question {
            question: s.to_string(),
            ..Question::default()
        };
    }
    let options = value
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .map(|o| match o.as_str() {
                    Some(label) => QuestionOption {
                        label: label.to_string(),
                        description: None,
                    },
                    None => QuestionOption {
                        label: str_field(o, "label"),
                        description: o
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    Question {
        question: str_field(value, "question"),
        header: value
            .get("header")
            .and_then(Value::as_str)
            .map(str::to_string),
        options,
        multi_select: value
            .get("multiSelect")
            .or_else(|| value.get("multi_select"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn error_strings(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(errors) = value.get("errors").and_then(Value::as_array) {
        for e in errors {
            match e {
                Value::String(s) => out.push(s.clone()),
                other => out.push(other.to_string()),
            }
        }
    }
    if let Some(e) = value.get("error").and_then(Value::as_str) {
        out.push(e.to_string());
    }
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translator() -> Translator {
        Translator::new(PendingRequests::new())
    }

    fn one(t: &mut Translator, line: &str) -> AgentEvent {
        let mut events = t.translate_line(line);
        assert_eq!(events.len(), 1, "expected one event from {line}");
        events.remove(0)
    }

    #[test]
    fn blank_lines_produce_nothing() {
        let mut t = translator();
        assert!(t.translate_line("").is_empty());
        assert!(t.translate_line("   \r").is_empty());
    }

    #[test]
    fn non_json_degrades_to_text() {
        let mut t = translator();
        let ev = one(&mut t, "reticulating splines...");
        assert_eq!(
            ev,
            AgentEvent::Text {
                text: "reticulating splines...".into()
            }
        );
    }

    #[test]
    fn unknown_type_degrades_to_raw() {
        let mut t = translator();
        let line = r#"{"type":"mystery","x":1}"#;
        assert_eq!(
            one(&mut t, line),
            AgentEvent::Raw { line: line.into() }
        );
    }

    #[test]
    fn object_without_type_degrades_to_raw() {
        let mut t = translator();
        let line = r#"{"x":1}"#;
        assert_eq!(one(&mut t, line), AgentEvent::Raw { line: line.into() });
    }

    #[test]
    fn system_init_is_swallowed_and_session_id_captured() {
        let mut t = translator();
        let events =
            t.translate_line(r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#);
        assert!(events.is_empty());
        assert_eq!(t.native_session_id(), Some("abc-123"));
    }

    #[test]
    fn other_system_lines_become_system_events() {
        let mut t = translator();
        let line = r#"{"type":"system","subtype":"status","message":"compacting"}"#;
        assert_eq!(
            one(&mut t, line),
            AgentEvent::System {
                content: line.into()
            }
        );
    }

    #[test]
    fn contiguous_text_blocks_accumulate() {
        let mut t = translator();
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"},
            ]},
        })
        .to_string();
        assert_eq!(
            one(&mut t, &line),
            AgentEvent::Text {
                text: "Hello world".into()
            }
        );
    }

    #[test]
    fn tool_use_flushes_pending_text() {
        let mut t = translator();
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}},
                {"type": "text", "text": "Done."},
            ]},
        })
        .to_string();
        let events = t.translate_line(&line);
        assert_eq!(
            events,
            vec![
                AgentEvent::Text {
                    text: "Let me check.".into()
                },
                AgentEvent::ToolCall {
                    id: "t1".into(),
                    name: "Bash".into(),
                    input: json!({"command": "ls"}),
                },
                AgentEvent::Text {
                    text: "Done.".into()
                },
            ]
        );
    }

    #[test]
    fn server_tool_use_is_a_tool_call() {
        let mut t = translator();
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "server_tool_use", "id": "t9", "name": "WebSearch", "input": {}},
            ]},
        })
        .to_string();
        assert!(matches!(
            one(&mut t, &line),
            AgentEvent::ToolCall { ref name, .. } if name == "WebSearch"
        ));
    }

    #[test]
    fn assistant_without_content_array_degrades_to_raw() {
        let mut t = translator();
        let line = r#"{"type":"assistant","message":{"content":"plain"}}"#;
        assert_eq!(one(&mut t, line), AgentEvent::Raw { line: line.into() });
    }

    #[test]
    fn tool_result_with_string_content() {
        let mut t = translator();
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "a.txt\nb.txt"},
            ]},
        })
        .to_string();
        assert_eq!(
            one(&mut t, &line),
            AgentEvent::ToolResult {
                id: "t1".into(),
                content: "a.txt\nb.txt".into()
            }
        );
    }

    #[test]
    fn image_tool_result_becomes_warning_only() {
        let mut t = translator();
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1",
                 "content": [{"type": "image", "source": {"type": "base64"}}]},
            ]},
        })
        .to_string();
        let events = t.translate_line(&line);
        assert_eq!(events.len(), 1, "no tool_result may be emitted");
        assert!(matches!(
            &events[0],
            AgentEvent::Warning { code, .. } if code == WARN_IMAGE_NOT_SUPPORTED
        ));
    }

    #[test]
    fn non_string_tool_result_content_falls_back_to_raw_json() {
        let mut t = translator();
        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": {"ok": true}},
            ]},
        })
        .to_string();
        assert_eq!(
            one(&mut t, &line),
            AgentEvent::ToolResult {
                id: "t1".into(),
                content: r#"{"ok":true}"#.into()
            }
        );
    }

    #[test]
    fn local_command_tags_become_command_output() {
        let mut t = translator();
        let content = "noise<local-command-stdout>out1</local-command-stdout>\
                       mid<local-command-stderr>err1</local-command-stderr>tail";
        let line = json!({"type": "user", "message": {"content": content}}).to_string();
        let events = t.translate_line(&line);
        assert_eq!(
            events,
            vec![
                AgentEvent::CommandOutput {
                    stream: OutputStream::Stdout,
                    content: "out1".into()
                },
                AgentEvent::CommandOutput {
                    stream: OutputStream::Stderr,
                    content: "err1".into()
                },
            ]
        );
    }

    #[test]
    fn untagged_string_user_message_is_discarded() {
        let mut t = translator();
        let line = json!({"type": "user", "message": {"content": "just text"}}).to_string();
        assert!(t.translate_line(&line).is_empty());
    }

    #[test]
    fn result_success_is_done() {
        let mut t = translator();
        assert_eq!(
            one(&mut t, r#"{"type":"result","subtype":"success"}"#),
            AgentEvent::Done
        );
    }

    #[test]
    fn aborted_result_is_interrupted() {
        let mut t = translator();
        let line = r#"{"type":"result","subtype":"error_during_execution","errors":["Error: Request was aborted."]}"#;
        assert_eq!(one(&mut t, line), AgentEvent::Interrupted);
    }

    #[test]
    fn error_result_without_abort_is_done() {
        let mut t = translator();
        let line = r#"{"type":"result","subtype":"error_during_execution","errors":["boom"]}"#;
        assert_eq!(one(&mut t, line), AgentEvent::Done);
    }

    #[test]
    fn permission_request_from_control_request() {
        let mut t = translator();
        let line = json!({
            "type": "control_request",
            "request_id": "r1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "ls"},
                "tool_use_id": "t1",
                "permission_suggestions": [{"type": "addRules"}],
            },
        })
        .to_string();
        match one(&mut t, &line) {
            AgentEvent::PermissionRequest {
                request_id,
                tool_use_id,
                tool_name,
                input,
                suggestions,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool_use_id, "t1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(input["command"], "ls");
                assert!(suggestions.is_some());
            }
            other => panic!("expected PermissionRequest, got {other:?}"),
        }
    }

    #[test]
    fn ask_user_question_parses_questions() {
        let mut t = translator();
        let line = json!({
            "type": "control_request",
            "request_id": "r2",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "AskUserQuestion",
                "tool_use_id": "t2",
                "input": {"questions": [
                    {"question": "Which color?", "header": "Theme",
                     "options": [{"label": "blue"}, "red"], "multiSelect": true},
                    "Free-form?",
                ]},
            },
        })
        .to_string();
        match one(&mut t, &line) {
            AgentEvent::AskUserQuestion { questions, .. } => {
                assert_eq!(questions.len(), 2);
                assert_eq!(questions[0].question, "Which color?");
                assert_eq!(questions[0].options.len(), 2);
                assert_eq!(questions[0].options[1].label, "red");
                assert!(questions[0].multi_select);
                assert_eq!(questions[1].question, "Free-form?");
                assert!(questions[1].options.is_empty());
            }
            other => panic!("expected AskUserQuestion, got {other:?}"),
        }
    }

    #[test]
    fn unknown_control_request_subtype_is_ignored() {
        let mut t = translator();
        let line = r#"{"type":"control_request","request_id":"r3","request":{"subtype":"hook"}}"#;
        assert!(t.translate_line(line).is_empty());
    }

    #[test]
    fn control_cancel_request() {
        let mut t = translator();
        assert_eq!(
            one(
                &mut t,
                r#"{"type":"control_cancel_request","request_id":"r1"}"#
            ),
            AgentEvent::RequestCancelled {
                request_id: "r1".into()
            }
        );
    }

    #[test]
    fn progress_is_dropped() {
        let mut t = translator();
        assert!(t
            .translate_line(r#"{"type":"progress","percent":40}"#)
            .is_empty());
    }

    #[test]
    fn interrupt_response_correlates_to_exactly_one_interrupted() {
        let pending = PendingRequests::new();
        pending.register("rX", PendingKind::Interrupt);
        let mut t = Translator::new(pending);

        let response =
            r#"{"type":"control_response","response":{"subtype":"success","request_id":"rX"}}"#;
        assert_eq!(one(&mut t, response), AgentEvent::Interrupted);

        // The follow-up aborted result is swallowed: one interrupt per turn.
        let aborted = r#"{"type":"result","subtype":"error_during_execution","errors":["Error: Request was aborted."]}"#;
        assert!(t.translate_line(aborted).is_empty());

        // The next turn's abort reports again.
        assert_eq!(one(&mut t, aborted), AgentEvent::Interrupted);
    }

    #[test]
    fn echoed_control_response_is_dropped() {
        let pending = PendingRequests::new();
        pending.register("r1", PendingKind::Sent);
        let mut t = Translator::new(pending);
        let response =
            r#"{"type":"control_response","response":{"subtype":"success","request_id":"r1"}}"#;
        assert!(t.translate_line(response).is_empty());
    }

    #[test]
    fn unmatched_control_response_is_dropped() {
        let mut t = translator();
        let response =
            r#"{"type":"control_response","response":{"subtype":"success","request_id":"zz"}}"#;
        assert!(t.translate_line(response).is_empty());
    }
}
