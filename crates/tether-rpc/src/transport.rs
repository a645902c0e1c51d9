// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Transport seams.
//!
//! The dispatcher is transport-agnostic: anything that can deliver whole
//! messages in order works — an axum WebSocket, a relay virtual stream, or
//! an in-memory channel pair in tests. The sink side is shared (handlers,
//! watchers and session pumps all write); implementations serialize writes
//! internally so frames never interleave.

use tokio::sync::mpsc;

use tether_events::SinkClosed;

/// The read half: one inbound message at a time, `None` on close.
#[async_trait::async_trait]
pub trait RpcSource: Send {
    async fn recv(&mut self) -> Option<String>;
}

/// The shared write half. One frame per call, total order per connection.
#[async_trait::async_trait]
pub trait RpcSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), SinkClosed>;
}

#[async_trait::async_trait]
impl RpcSource for mpsc::Receiver<String> {
    async fn recv(&mut self) -> Option<String> {
        mpsc::Receiver::recv(self).await
    }
}

/// Channel-backed sink: used by relay virtual streams and tests. The
/// unbounded sender is already serialized, so no extra lock is needed.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl RpcSink for ChannelSink {
    async fn send_text(&self, text: String) -> Result<(), SinkClosed> {
        self.tx.send(text).map_err(|_| SinkClosed)
    }
}

/// An in-memory duplex pair for tests: (client side, server side).
pub fn memory_pair() -> (MemoryClient, (mpsc::Receiver<String>, ChannelSink)) {
    let (client_tx, server_rx) = mpsc::channel(64);
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        MemoryClient {
            tx: client_tx,
            rx: client_rx,
        },
        (server_rx, ChannelSink::new(server_tx)),
    )
}

/// Client half of [`memory_pair`].
pub struct MemoryClient {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryClient {
    pub async fn send(&self, value: serde_json::Value) {
        self.tx
            .send(value.to_string())
            .await
            .expect("server hung up");
    }

    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        let text = self.rx.recv().await?;
        serde_json::from_str(&text).ok()
    }
}
