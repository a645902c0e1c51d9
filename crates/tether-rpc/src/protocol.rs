// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! JSON-RPC 2.0 wire types.
//!
//! One JSON value per message; the transport preserves message boundaries
//! (WebSocket text frames, or one value per relay envelope). A message with
//! an `id` is a request expecting exactly one response; without an `id` it
//! is a notification. The server also initiates notifications — peers are
//! distinguished by direction of flow, not by role.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Tether-specific codes, stable across releases.
pub const UNAUTHENTICATED: i64 = -32000;
pub const NOT_FOUND: i64 = -32001;
pub const TIMEOUT: i64 = -32002;
pub const RESYNC_REQUIRED: i64 = -32003;
pub const CONNECTION_CLOSED: i64 = -32004;

/// An incoming request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Numeric or string id; absent (or null) for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }
}

/// A structured handler failure, rendered into the response `error` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(UNAUTHENTICATED, "authenticate first")
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, what)
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method {method}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, detail.to_string())
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT, "request handler timed out")
    }
}

/// Successful response frame.
pub fn response_ok(id: Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

/// Error response frame.
pub fn response_err(id: Value, error: RpcError) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error})
}

/// Server-initiated notification frame.
pub fn notification_frame(method: &str, params: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "method": method, "params": params})
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_numeric_id() {
        let r: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"auth","params":{}}"#)
                .unwrap();
        assert_eq!(r.id, Some(json!(7)));
        assert_eq!(r.method, "auth");
        assert!(!r.is_notification());
    }

    #[test]
    fn request_with_string_id() {
        let r: Request =
            serde_json::from_str(r#"{"id":"a1","method":"session.list"}"#).unwrap();
        assert_eq!(r.id, Some(json!("a1")));
    }

    #[test]
    fn missing_or_null_id_is_a_notification() {
        let r: Request = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert!(r.is_notification());
        let r: Request = serde_json::from_str(r#"{"id":null,"method":"ping"}"#).unwrap();
        assert!(r.is_notification());
    }

    #[test]
    fn response_frames_are_well_formed() {
        let ok = response_ok(json!(1), json!({"version": "0.4.2"}));
        assert_eq!(ok["jsonrpc"], "2.0");
        assert_eq!(ok["id"], 1);
        assert!(ok.get("error").is_none());

        let err = response_err(json!(2), RpcError::unauthenticated());
        assert_eq!(err["error"]["code"], UNAUTHENTICATED);
        assert!(err.get("result").is_none());
    }

    #[test]
    fn notification_frame_has_no_id() {
        let n = notification_frame("fs.changed", json!({"subscription_id": "w_x"}));
        assert!(n.get("id").is_none());
        assert_eq!(n["method"], "fs.changed");
    }

    #[test]
    fn rpc_error_round_trips() {
        let e = RpcError::not_found("session s9 not found");
        let v = serde_json::to_value(&e).unwrap();
        let back: RpcError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }
}
