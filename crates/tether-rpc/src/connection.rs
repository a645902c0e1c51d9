// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-connection state.
//!
//! A connection is one authenticated duplex stream. It owns its worktree
//! binding (empty string = main checkout), the set of subscriptions it
//! created, and a cancellation token that tears down in-flight handler
//! work on disconnect. It is also the [`NotificationSink`] the watchers
//! and session pumps deliver into.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tether_events::{Notification, NotificationSink, SinkClosed};

use crate::protocol::{notification_frame, response_err, response_ok, RpcError};
use crate::transport::RpcSink;

/// What a subscription id points at, for disconnect cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubKind {
    Fs,
    Git,
    Worktree,
    SessionList,
    Chat { session_id: String },
}

pub struct Connection {
    sink: Arc<dyn RpcSink>,
    authenticated: AtomicBool,
    /// Worktree binding: (name, resolved root). Empty name = main.
    worktree: StdMutex<(String, PathBuf)>,
    subs: StdMutex<HashMap<String, SubKind>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(sink: Arc<dyn RpcSink>, main_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            sink,
            authenticated: AtomicBool::new(false),
            worktree: StdMutex::new((String::new(), main_root)),
            subs: StdMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    /// The binding name; empty = main.
    pub fn worktree_name(&self) -> String {
        self.worktree.lock().expect("worktree lock").0.clone()
    }

    /// The directory all path-scoped operations resolve against.
    pub fn effective_root(&self) -> PathBuf {
        self.worktree.lock().expect("worktree lock").1.clone()
    }

    pub fn bind_worktree(&self, name: String, root: PathBuf) {
        *self.worktree.lock().expect("worktree lock") = (name, root);
    }

    pub fn track_subscription(&self, id: String, kind: SubKind) {
        self.subs.lock().expect("subs lock").insert(id, kind);
    }

    /// Remove one tracked subscription, returning its kind.
    pub fn untrack_subscription(&self, id: &str) -> Option<SubKind> {
        self.subs.lock().expect("subs lock").remove(id)
    }

    /// Drain every tracked subscription (disconnect cleanup).
    pub fn drain_subscriptions(&self) -> Vec<(String, SubKind)> {
        self.subs.lock().expect("subs lock").drain().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().expect("subs lock").len()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn respond(&self, id: Value, result: Result<Value, RpcError>) {
        let frame = match result {
            Ok(value) => response_ok(id, value),
            Err(error) => response_err(id, error),
        };
        let _ = self.sink.send_text(frame.to_string()).await;
    }
}

#[async_trait::async_trait]
impl NotificationSink for Connection {
    async fn notify(&self, n: Notification) -> Result<(), SinkClosed> {
        if self.is_closed() {
            return Err(SinkClosed);
        }
        self.sink
            .send_text(notification_frame(&n.method, n.params).to_string())
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
