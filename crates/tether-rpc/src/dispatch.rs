// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The per-connection dispatch loop.
//!
//! Each inbound frame is parsed and handled in its own task so a slow
//! handler never blocks the connection; the 30 s deadline is enforced
//! here, and a disconnect cancels everything still in flight before the
//! connection's subscriptions are released.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use tether_session::SessionManager;
use tether_vcs::Vcs;
use tether_watch::{FsWatcher, GitWatcher, SessionListWatcher, WorktreeWatcher};

use crate::connection::{Connection, SubKind};
use crate::handlers;
use crate::protocol::{Request, RpcError, INVALID_REQUEST, PARSE_ERROR};
use crate::transport::{RpcSink, RpcSource};
use crate::{NodeInfo, TokenVerifier};

/// Deadline for a single request handler.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the handlers need, shared across connections.
pub struct Shared {
    pub info: NodeInfo,
    pub verifier: Arc<dyn TokenVerifier>,
    pub sessions: SessionManager,
    pub fs_watch: FsWatcher,
    pub git_watch: GitWatcher,
    pub worktree_watch: WorktreeWatcher,
    pub session_list_watch: SessionListWatcher,
    /// Rooted at the main checkout; worktree-bound requests re-root.
    pub vcs: Vcs,
    /// Where `worktree.create` places new checkouts.
    pub worktree_dir: PathBuf,
}

/// Run one connection to completion.
pub async fn serve(shared: Arc<Shared>, mut source: impl RpcSource, sink: Arc<dyn RpcSink>) {
    let conn = Connection::new(sink, shared.info.work_dir.clone());
    info!("rpc connection opened");

    loop {
        let message = tokio::select! {
            _ = conn.cancel_token().cancelled() => break,
            message = source.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        handle_frame(&shared, &conn, message);
    }

    conn.close();
    cleanup(&shared, &conn);
    info!("rpc connection closed");
}

fn handle_frame(shared: &Arc<Shared>, conn: &Arc<Connection>, text: String) {
    let request: Request = match serde_json::from_str::<Value>(&text) {
        Err(err) => {
            debug!("unparseable rpc frame: {err}");
            return reject(conn, RpcError::new(PARSE_ERROR, format!("parse error: {err}")));
        }
        Ok(value) => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                debug!("malformed rpc request: {err}");
                return reject(
                    conn,
                    RpcError::new(INVALID_REQUEST, format!("invalid request: {err}")),
                );
            }
        },
    };

    let shared = shared.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let id = request.id.clone();
        let method = request.method.clone();
        let result = tokio::select! {
            _ = conn.cancel_token().cancelled() => return,
            outcome = tokio::time::timeout(
                HANDLER_TIMEOUT,
                handlers::route(&shared, &conn, &request.method, request.params),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(%method, "handler deadline exceeded");
                    Err(RpcError::timeout())
                }
            },
        };
        if let Err(ref err) = result {
            debug!(%method, code = err.code, "request failed: {}", err.message);
        }
        match id {
            Some(id) if !id.is_null() => conn.respond(id, result).await,
            _ => {} // notification: no response
        }
    });
}

fn reject(conn: &Arc<Connection>, error: RpcError) {
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.respond(Value::Null, Err(error)).await;
    });
}

/// Release everything the connection owned.
fn cleanup(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    for (id, kind) in conn.drain_subscriptions() {
        let released = match &kind {
            SubKind::Fs => shared.fs_watch.unsubscribe(&id).is_ok(),
            SubKind::Git => shared.git_watch.unsubscribe(&id).is_ok(),
            SubKind::Worktree => shared.worktree_watch.unsubscribe(&id).is_ok(),
            SubKind::SessionList => shared.session_list_watch.unsubscribe(&id).is_ok(),
            SubKind::Chat { session_id } => {
                shared.sessions.unsubscribe_chat(session_id, &id);
                true
            }
        };
        if !released {
            // Already gone (e.g. torn down by a forced resync): nothing to do.
            debug!(%id, "subscription was already released");
        }
    }
}
