// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Control messages exchanged with the assistant inside the line-JSON
//! stream, and the pending-request map that correlates responses.
//!
//! The assistant and the server both initiate control requests. Every id
//! the server emits is recorded in [`PendingRequests`] tagged by kind, so
//! that when a `control_response` shows up on stdout the translator can
//! tell a reply to our own interrupt (emit `Interrupted`) from an echo of
//! a response we wrote ourselves (drop).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde_json::{json, Value};

/// Why a request id is in the pending map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// A server-initiated interrupt; the matching response yields an
    /// `Interrupted` event.
    Interrupt,
    /// A response the server sent for an assistant-initiated request; a
    /// matching `control_response` is an echo and is dropped.
    Sent,
}

/// Shared map of in-flight control-request ids.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingKind>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, kind: PendingKind) {
        self.inner
            .lock()
            .expect("pending map poisoned")
            .insert(request_id.to_string(), kind);
    }

    /// Remove and return the entry for `request_id`, if any.
    pub fn resolve(&self, request_id: &str) -> Option<PendingKind> {
        self.inner
            .lock()
            .expect("pending map poisoned")
            .remove(request_id)
    }
}

/// 16 random bytes rendered as hex — the id format for server-initiated
/// control requests.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fields of a pending permission request the server must echo back when
/// answering.
#[derive(Debug, Clone)]
pub struct PermissionRequestData {
    pub request_id: String,
    pub tool_use_id: String,
    pub input: Value,
    pub suggestions: Option<Value>,
}

/// Fields of a pending question request.
#[derive(Debug, Clone)]
pub struct QuestionRequestData {
    pub request_id: String,
    pub tool_use_id: String,
}

// ── Wire shapes written to the assistant's stdin ──────────────────────────────

/// A user prompt: `{type:"user", message:{role, content:[{type:"text", …}]}}`.
pub fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        },
    })
}

/// The server-initiated interrupt request.
pub fn interrupt_request(request_id: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": "interrupt"},
    })
}

/// Envelope for any successful control response.
pub fn control_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

/// Permission allow. `updated_permissions` is attached for "always allow".
pub fn permission_allow(
    tool_use_id: &str,
    updated_input: Value,
    updated_permissions: Option<Value>,
) -> Value {
    let mut response = json!({
        "behavior": "allow",
        "toolUseID": tool_use_id,
        "updatedInput": updated_input,
    });
    if let (Some(map), Some(perms)) = (response.as_object_mut(), updated_permissions) {
        map.insert("updatedPermissions".into(), perms);
    }
    response
}

/// Permission deny — also used to cancel a question.
pub fn permission_deny(tool_use_id: &str, message: &str) -> Value {
    json!({
        "behavior": "deny",
        "message": message,
        "interrupt": true,
        "toolUseID": tool_use_id,
    })
}

/// Question answer: an allow whose updated input carries the answers.
pub fn question_answer(tool_use_id: &str, answers: &[String]) -> Value {
    json!({
        "behavior": "allow",
        "toolUseID": tool_use_id,
        "updatedInput": {"answers": answers},
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
