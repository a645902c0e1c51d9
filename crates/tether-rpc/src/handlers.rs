// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Method handlers.
//!
//! Every handler takes and returns JSON objects; failures are structured
//! [`RpcError`]s with stable codes. Path-scoped methods resolve against
//! the connection's worktree binding, never against the raw main checkout.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use tether_events::{PermissionChoice, SessionMode};
use tether_session::{ChatSubscriber, SessionError};
use tether_vcs::{Vcs, VcsError};
use tether_watch::{new_subscription_id, WatchError};

use crate::connection::{Connection, SubKind};
use crate::dispatch::Shared;
use crate::protocol::{RpcError, CONNECTION_CLOSED, UNAUTHENTICATED};

/// Chat subscriptions are connection-local; they share the id format of the
/// watcher kinds.
const CHAT_PREFIX: &str = "c_";

/// Maximum size served by `file.read`.
const MAX_FILE_READ: u64 = 10 * 1024 * 1024;

pub async fn route(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    if method == "auth" {
        return auth(shared, conn, params).await;
    }
    if !conn.is_authenticated() {
        return Err(RpcError::unauthenticated());
    }

    match method {
        // ── Worktrees ─────────────────────────────────────────────────────
        "worktree.switch" => worktree_switch(shared, conn, params).await,
        "worktree.list" => worktree_list(shared).await,
        "worktree.create" => worktree_create(shared, params).await,
        "worktree.delete" => worktree_delete(shared, params).await,
        "worktree.subscribe" => {
            let id = shared.worktree_watch.subscribe(sink(conn));
            conn.track_subscription(id.clone(), SubKind::Worktree);
            Ok(json!({"id": id}))
        }
        "worktree.unsubscribe" => unsubscribe(shared, conn, params, SubKind::Worktree),

        // ── Sessions ──────────────────────────────────────────────────────
        "session.list" => {
            let sessions = shared.sessions.list().await?;
            Ok(json!({"sessions": sessions}))
        }
        "session.list.subscribe" => {
            let sessions = shared.sessions.list().await?;
            let id = shared.session_list_watch.subscribe(sink(conn));
            conn.track_subscription(id.clone(), SubKind::SessionList);
            Ok(json!({"id": id, "initial": {"sessions": sessions}}))
        }
        "session.list.unsubscribe" => unsubscribe(shared, conn, params, SubKind::SessionList),
        "session.create" => session_create(shared, conn, params).await,
        "session.delete" => {
            let p: SessionTarget = parse(params)?;
            shared.sessions.delete(&p.session_id).await?;
            Ok(json!({}))
        }
        "session.update_title" => {
            let p: UpdateTitleParams = parse(params)?;
            let meta = shared.sessions.update_title(&p.session_id, p.title).await?;
            Ok(json!({"session": meta}))
        }
        "session.set_mode" => {
            let p: SetModeParams = parse(params)?;
            let meta = shared.sessions.set_mode(&p.session_id, p.mode).await?;
            Ok(json!({"session": meta}))
        }
        "session.activate" => {
            let p: SessionTarget = parse(params)?;
            let meta = shared.sessions.activate(&p.session_id).await?;
            Ok(json!({"session": meta}))
        }
        "session.get_history" => {
            let p: SessionTarget = parse(params)?;
            let events = shared.sessions.history(&p.session_id).await?;
            let records: Vec<Value> = events.iter().map(|e| e.to_record()).collect();
            Ok(json!({"events": records}))
        }

        // ── Chat ──────────────────────────────────────────────────────────
        "chat.subscribe" => chat_subscribe(shared, conn, params).await,
        "chat.unsubscribe" => {
            let p: SubscriptionTarget = parse(params)?;
            match conn.untrack_subscription(&p.id) {
                Some(SubKind::Chat { session_id }) => {
                    shared.sessions.unsubscribe_chat(&session_id, &p.id);
                    Ok(json!({}))
                }
                Some(other) => {
                    // Wrong kind: restore and reject.
                    conn.track_subscription(p.id.clone(), other);
                    Err(RpcError::not_found(format!("unknown chat subscription {}", p.id)))
                }
                None => Err(RpcError::not_found(format!(
                    "unknown chat subscription {}",
                    p.id
                ))),
            }
        }
        "chat.send_message" => {
            let p: SendMessageParams = parse(params)?;
            shared.sessions.send_message(&p.session_id, &p.text).await?;
            Ok(json!({}))
        }
        "chat.interrupt" => {
            let p: SessionTarget = parse(params)?;
            shared.sessions.interrupt(&p.session_id).await?;
            Ok(json!({}))
        }
        "chat.permission_response" => {
            let p: PermissionResponseParams = parse(params)?;
            shared
                .sessions
                .permission_response(&p.session_id, &p.request_id, p.choice)
                .await?;
            Ok(json!({}))
        }
        "chat.question_response" => {
            let p: QuestionResponseParams = parse(params)?;
            shared
                .sessions
                .question_response(&p.session_id, &p.request_id, p.answers)
                .await?;
            Ok(json!({}))
        }

        // ── Filesystem watcher ────────────────────────────────────────────
        "fs.subscribe" => {
            let p: PathParams = parse(params)?;
            let target = resolve_path(&conn.effective_root(), &p.path)?;
            let id = shared.fs_watch.subscribe(&target, sink(conn))?;
            conn.track_subscription(id.clone(), SubKind::Fs);
            Ok(json!({"id": id}))
        }
        "fs.unsubscribe" => unsubscribe(shared, conn, params, SubKind::Fs),

        // ── Git ───────────────────────────────────────────────────────────
        "git.status" => {
            let status = scoped_vcs(conn).status().await?;
            Ok(json!({"entries": status.entries}))
        }
        "git.diff" => {
            let p: DiffParams = parse(params)?;
            let diff = scoped_vcs(conn)
                .diff(p.path.as_deref(), p.staged)
                .await?;
            Ok(json!({"diff": diff}))
        }
        "git.stage" => {
            let p: PathsParams = parse(params)?;
            scoped_vcs(conn).stage(&p.paths).await?;
            Ok(json!({}))
        }
        "git.unstage" => {
            let p: PathsParams = parse(params)?;
            scoped_vcs(conn).unstage(&p.paths).await?;
            Ok(json!({}))
        }
        "git.subscribe" => {
            let id = shared.git_watch.subscribe(sink(conn));
            conn.track_subscription(id.clone(), SubKind::Git);
            Ok(json!({"id": id}))
        }
        "git.unsubscribe" => unsubscribe(shared, conn, params, SubKind::Git),

        // ── Files ─────────────────────────────────────────────────────────
        "file.read" => file_read(conn, params).await,
        "file.list" => file_list(conn, params).await,

        other => Err(RpcError::method_not_found(other)),
    }
}

// ── Auth ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AuthParams {
    token: String,
    #[serde(default)]
    worktree: Option<String>,
}

async fn auth(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: AuthParams = parse(params)?;
    if !shared.verifier.verify(&p.token) {
        return Err(RpcError::new(UNAUTHENTICATED, "invalid token"));
    }
    if let Some(name) = p.worktree.filter(|n| !n.is_empty()) {
        let root = worktree_root(shared, &name).await?;
        conn.bind_worktree(name, root);
    }
    conn.set_authenticated();
    Ok(json!({
        "version": shared.info.version,
        "title": shared.info.title,
        "work_dir": shared.info.work_dir,
        "agent": shared.info.agent,
    }))
}

// ── Worktrees ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WorktreeTarget {
    #[serde(alias = "name")]
    worktree: String,
}

async fn worktree_root(shared: &Arc<Shared>, name: &str) -> Result<PathBuf, RpcError> {
    let list = shared.vcs.worktrees().await?;
    list.find(name)
        .map(|w| w.path.clone())
        .ok_or_else(|| RpcError::not_found(format!("worktree {name} not found")))
}

async fn worktree_switch(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: WorktreeTarget = parse(params)?;
    if p.worktree.is_empty() {
        conn.bind_worktree(String::new(), shared.info.work_dir.clone());
    } else {
        let root = worktree_root(shared, &p.worktree).await?;
        conn.bind_worktree(p.worktree, root);
    }
    Ok(json!({"worktree": conn.worktree_name(), "root": conn.effective_root()}))
}

async fn worktree_list(shared: &Arc<Shared>) -> Result<Value, RpcError> {
    let list = shared.vcs.worktrees().await?;
    Ok(json!({"main": list.main, "worktrees": list.linked}))
}

async fn worktree_create(shared: &Arc<Shared>, params: Value) -> Result<Value, RpcError> {
    let p: WorktreeTarget = parse(params)?;
    if p.worktree.is_empty() || p.worktree.contains(['/', '\\']) {
        return Err(RpcError::invalid_params("worktree name must be a plain name"));
    }
    let dir = shared.worktree_dir.join(&p.worktree);
    let worktree = shared.vcs.worktree_create(&p.worktree, &dir).await?;
    Ok(json!({"worktree": worktree}))
}

async fn worktree_delete(shared: &Arc<Shared>, params: Value) -> Result<Value, RpcError> {
    let p: WorktreeTarget = parse(params)?;
    shared.vcs.worktree_delete(&p.worktree).await?;
    Ok(json!({}))
}

// ── Sessions & chat ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionTarget {
    #[serde(alias = "id")]
    session_id: String,
}

#[derive(Deserialize)]
struct SubscriptionTarget {
    id: String,
}

#[derive(Deserialize)]
struct CreateSessionParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    mode: Option<SessionMode>,
}

#[derive(Deserialize)]
struct UpdateTitleParams {
    #[serde(alias = "id")]
    session_id: String,
    title: String,
}

#[derive(Deserialize)]
struct SetModeParams {
    #[serde(alias = "id")]
    session_id: String,
    mode: SessionMode,
}

#[derive(Deserialize)]
struct SendMessageParams {
    session_id: String,
    text: String,
}

#[derive(Deserialize)]
struct PermissionResponseParams {
    session_id: String,
    request_id: String,
    choice: PermissionChoice,
}

#[derive(Deserialize)]
struct QuestionResponseParams {
    session_id: String,
    request_id: String,
    /// Absent or null records a cancellation.
    #[serde(default)]
    answers: Option<Vec<String>>,
}

async fn session_create(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: CreateSessionParams = parse(params)?;
    let meta = shared
        .sessions
        .create(
            p.id,
            p.title,
            p.mode.unwrap_or_default(),
            Some(conn.effective_root()),
        )
        .await?;
    Ok(json!({"session": meta}))
}

async fn chat_subscribe(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: SessionTarget = parse(params)?;
    let id = new_subscription_id(CHAT_PREFIX);
    let snapshot = shared
        .sessions
        .subscribe_chat(
            &p.session_id,
            ChatSubscriber {
                id: id.clone(),
                sink: sink(conn),
            },
        )
        .await?;
    conn.track_subscription(
        id.clone(),
        SubKind::Chat {
            session_id: p.session_id,
        },
    );
    let history: Vec<Value> = snapshot.history.iter().map(|e| e.to_record()).collect();
    Ok(json!({
        "id": id,
        "initial": {
            "history": history,
            "running": snapshot.running,
            "mode": snapshot.mode,
        },
    }))
}

// ── Files ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize, Default)]
struct OptionalPathParams {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct PathsParams {
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct DiffParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    staged: bool,
}

async fn file_read(conn: &Arc<Connection>, params: Value) -> Result<Value, RpcError> {
    let p: PathParams = parse(params)?;
    let path = resolve_path(&conn.effective_root(), &p.path)?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| RpcError::not_found(format!("file {} not found", p.path)))?;
    if meta.len() > MAX_FILE_READ {
        return Err(RpcError::invalid_params(format!(
            "file larger than {MAX_FILE_READ} bytes"
        )));
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| RpcError::internal(format!("reading {}: {err}", p.path)))?;
    Ok(json!({"content": String::from_utf8_lossy(&bytes)}))
}

async fn file_list(conn: &Arc<Connection>, params: Value) -> Result<Value, RpcError> {
    let p: OptionalPathParams = if params.is_null() {
        OptionalPathParams::default()
    } else {
        parse(params)?
    };
    let rel = p.path.unwrap_or_default();
    let dir = resolve_path(&conn.effective_root(), &rel)?;
    let mut read_dir = tokio::fs::read_dir(&dir)
        .await
        .map_err(|_| RpcError::not_found(format!("directory {rel} not found")))?;
    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": is_dir,
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({"entries": entries}))
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn sink(conn: &Arc<Connection>) -> Arc<Connection> {
    conn.clone()
}

fn scoped_vcs(conn: &Arc<Connection>) -> Vcs {
    Vcs::new(conn.effective_root())
}

/// Generic unsubscribe for the watcher kinds that carry no extra state.
fn unsubscribe(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    params: Value,
    expected: SubKind,
) -> Result<Value, RpcError> {
    let p: SubscriptionTarget = parse(params)?;
    match conn.untrack_subscription(&p.id) {
        Some(kind) if kind == expected => {
            let result = match kind {
                SubKind::Fs => shared.fs_watch.unsubscribe(&p.id),
                SubKind::Git => shared.git_watch.unsubscribe(&p.id),
                SubKind::Worktree => shared.worktree_watch.unsubscribe(&p.id),
                SubKind::SessionList => shared.session_list_watch.unsubscribe(&p.id),
                SubKind::Chat { .. } => unreachable!("chat has its own unsubscribe"),
            };
            result?;
            Ok(json!({}))
        }
        Some(other) => {
            conn.track_subscription(p.id.clone(), other);
            Err(RpcError::not_found(format!("unknown subscription {}", p.id)))
        }
        None => Err(RpcError::not_found(format!("unknown subscription {}", p.id))),
    }
}

/// Join a client-supplied relative path onto the connection's root,
/// rejecting anything that could escape it.
fn resolve_path(root: &Path, rel: &str) -> Result<PathBuf, RpcError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(RpcError::invalid_params("path escapes the working directory"));
    }
    Ok(root.join(rel_path))
}

// ── Error mapping ─────────────────────────────────────────────────────────────

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::NotFound(_) | SessionError::RequestNotFound(_) => {
                RpcError::not_found(err.to_string())
            }
            SessionError::Agent(tether_agent::AgentError::Closed) => {
                RpcError::new(CONNECTION_CLOSED, "session is closed")
            }
            _ => RpcError::internal(err),
        }
    }
}

impl From<VcsError> for RpcError {
    fn from(err: VcsError) -> Self {
        match &err {
            VcsError::WorktreeNotFound(_) | VcsError::NotARepository(_) => {
                RpcError::not_found(err.to_string())
            }
            _ => RpcError::internal(err),
        }
    }
}

impl From<WatchError> for RpcError {
    fn from(err: WatchError) -> Self {
        match &err {
            WatchError::UnknownSubscription(_) => RpcError::not_found(err.to_string()),
            WatchError::Fs(_) => RpcError::internal(err),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
