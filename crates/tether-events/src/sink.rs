// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Delivery seam between event producers and the transport.
//!
//! Session pumps and watchers push [`Notification`]s into a
//! [`NotificationSink`]; the RPC layer implements the trait on top of its
//! per-connection write lock. Producers never see the transport — a sink
//! that reports [`SinkClosed`] is simply unsubscribed.

use serde_json::Value;

/// A server-initiated JSON-RPC notification, before framing.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// The sink is gone; the subscription behind it should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("notification sink closed")]
pub struct SinkClosed;

/// Where notifications go. One implementor per connection.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification. Must not block indefinitely; a closed or
    /// dead connection returns [`SinkClosed`].
    async fn notify(&self, notification: Notification) -> Result<(), SinkClosed>;
}
