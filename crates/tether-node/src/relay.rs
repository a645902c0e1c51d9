// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Relay multiplexer.
//!
//! One outbound WebSocket to a cloud tunnel carries N logical client
//! connections as JSON envelopes. A `message` envelope for an unknown
//! `connection_id` materializes a *virtual stream* served by the same
//! dispatcher a direct WebSocket gets; `disconnected` tears it down.
//!
//! Each virtual stream has a bounded inbound buffer. When a client stalls
//! and the buffer fills, that one stream is closed — back-pressure must
//! never stall the trunk that all other clients share.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use tether_events::SinkClosed;
use tether_rpc::{RpcSink, Shared};
use tungstenite::Message;

/// Inbound frames buffered per virtual stream before it is dropped.
const STREAM_BUFFER: usize = 64;
/// Trunk write queue shared by all virtual streams.
const TRUNK_BUFFER: usize = 256;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// One frame on the trunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    connection_id: String,
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    Message,
    Disconnected,
    HttpRequest,
    HttpResponse,
}

/// Keep one trunk alive forever, reconnecting with capped backoff.
pub async fn run(url: String, shared: Arc<Shared>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(%url, "relay trunk connected");
                backoff = INITIAL_BACKOFF;
                run_trunk(ws, &shared).await;
                warn!(%url, "relay trunk disconnected");
            }
            Err(err) => {
                warn!(%url, "relay connect failed: {err}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_trunk(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shared: &Arc<Shared>,
) {
    let (mut trunk_tx, mut trunk_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(TRUNK_BUFFER);

    // Single writer: every virtual stream funnels through this task.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if trunk_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // connection_id → inbound sender of the virtual stream.
    let mut streams: HashMap<String, mpsc::Sender<String>> = HashMap::new();

    while let Some(frame) = trunk_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(err) => {
                debug!("unparseable relay envelope: {err}");
                continue;
            }
        };

        match envelope.kind {
            EnvelopeKind::Message => {
                let id = envelope.connection_id.clone();
                let tx = streams
                    .entry(id.clone())
                    .or_insert_with(|| open_stream(id.clone(), shared, out_tx.clone()));
                let Some(payload) = envelope.payload else {
                    continue;
                };
                use mpsc::error::TrySendError;
                match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // The stream is stalled; drop it rather than the trunk.
                        warn!(connection_id = %id, "virtual stream stalled, closing");
                        streams.remove(&id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        streams.remove(&id);
                    }
                }
            }
            EnvelopeKind::Disconnected => {
                debug!(connection_id = %envelope.connection_id, "virtual stream disconnected");
                streams.remove(&envelope.connection_id);
            }
            EnvelopeKind::HttpRequest | EnvelopeKind::HttpResponse => {
                // HTTP tunneling is outside the RPC core.
                debug!(connection_id = %envelope.connection_id, "ignoring http envelope");
            }
        }
    }

    // Trunk gone: dropping the senders ends every virtual serve loop, and
    // each one releases its subscriptions on the way out.
    streams.clear();
    writer.abort();
}

/// Materialize one virtual stream and dispatch it like a direct socket.
fn open_stream(
    connection_id: String,
    shared: &Arc<Shared>,
    out_tx: mpsc::Sender<Envelope>,
) -> mpsc::Sender<String> {
    info!(%connection_id, "virtual stream opened");
    let (in_tx, in_rx) = mpsc::channel::<String>(STREAM_BUFFER);
    let sink = Arc::new(VirtualSink {
        connection_id: connection_id.clone(),
        out: out_tx.clone(),
    });
    let shared = shared.clone();
    tokio::spawn(async move {
        tether_rpc::serve(shared, in_rx, sink).await;
        // Tell the tunnel the server side is done with this stream.
        let _ = out_tx
            .send(Envelope {
                connection_id: connection_id.clone(),
                kind: EnvelopeKind::Disconnected,
                payload: None,
            })
            .await;
        debug!(%connection_id, "virtual stream closed");
    });
    in_tx
}

/// Write half of a virtual stream: wraps frames into trunk envelopes.
struct VirtualSink {
    connection_id: String,
    out: mpsc::Sender<Envelope>,
}

#[async_trait::async_trait]
impl RpcSink for VirtualSink {
    async fn send_text(&self, text: String) -> Result<(), SinkClosed> {
        self.out
            .send(Envelope {
                connection_id: self.connection_id.clone(),
                kind: EnvelopeKind::Message,
                payload: Some(text),
            })
            .await
            .map_err(|_| SinkClosed)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let e = Envelope {
            connection_id: "conn-1".into(),
            kind: EnvelopeKind::Message,
            payload: Some("{\"id\":1}".into()),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["connection_id"], "conn-1");
        assert_eq!(v["type"], "message");
        assert_eq!(v["payload"], "{\"id\":1}");

        let back: Envelope = serde_json::from_value(v).unwrap();
        assert_eq!(back.kind, EnvelopeKind::Message);
    }

    #[test]
    fn disconnected_envelope_omits_payload() {
        let e = Envelope {
            connection_id: "conn-1".into(),
            kind: EnvelopeKind::Disconnected,
            payload: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("payload").is_none());
        assert_eq!(v["type"], "disconnected");
    }
}
