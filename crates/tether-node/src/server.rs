// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket listener — adapts axum sockets into the RPC dispatcher's
//! transport seams.
//!
//! The upgrade itself is unauthenticated: authentication happens in-band,
//! as the first `auth` call on the new connection. Everything after the
//! upgrade is one [`tether_rpc::serve`] loop per socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tether_events::SinkClosed;
use tether_rpc::{RpcSink, RpcSource, Shared};

/// Serve `/ws` until the listener fails or the process ends.
pub async fn serve_http(bind: &str, shared: Arc<Shared>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(shared);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "listening for WebSocket clients");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(shared): State<Arc<Shared>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, shared, peer))
}

async fn handle_socket(socket: WebSocket, shared: Arc<Shared>, peer: SocketAddr) {
    info!(%peer, "client connected");
    let (tx, rx) = socket.split();
    let sink = Arc::new(WsSink {
        tx: Mutex::new(tx),
    });
    tether_rpc::serve(shared, WsSource { rx }, sink).await;
    info!(%peer, "client disconnected");
}

/// Write half: one text frame per RPC message, serialized by the mutex so
/// concurrent handlers and watchers never interleave bytes.
struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl RpcSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), SinkClosed> {
        self.tx
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|_| SinkClosed)
    }
}

/// Read half: text frames are RPC messages; everything else is transport
/// noise.
struct WsSource {
    rx: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl RpcSource for WsSource {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.next().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // ping/pong/binary
                Err(err) => {
                    debug!("websocket read error: {err}");
                    return None;
                }
            }
        }
    }
}
