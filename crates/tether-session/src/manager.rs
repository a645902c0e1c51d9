// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The process-wide session registry.
//!
//! One [`SessionManager`] owns the mapping from session id to live
//! supervisor handle. Starting is serialized through a gate so two
//! concurrent callers can never race a second supervisor into existence
//! for the same id; the registry mutex itself is only ever held across map
//! operations, never across spawn or disk I/O.
//!
//! Each live session runs a *pump*: it drains the supervisor's event
//! channel, appends every event to the transcript first, tracks pending
//! permission/question requests, maintains the running flag for idle
//! accounting, and fans the notification shape out to chat subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_agent::{
    AgentConfig, AgentHandle, PermissionRequestData, QuestionRequestData, SpawnOptions,
};
use tether_events::{
    AgentEvent, NotificationSink, PermissionChoice, SessionMode,
};

use crate::store::{SessionMeta, SessionStore};
use crate::SessionError;

/// A chat subscription: a stable id plus the sink it delivers to.
#[derive(Clone)]
pub struct ChatSubscriber {
    pub id: String,
    pub sink: Arc<dyn NotificationSink>,
}

/// What `chat.subscribe` returns: the transcript so far plus live state.
pub struct ChatSnapshot {
    pub history: Vec<AgentEvent>,
    pub running: bool,
    pub mode: SessionMode,
}

#[derive(Clone)]
struct LiveSession {
    handle: AgentHandle,
    shared: Arc<LiveShared>,
}

struct LiveShared {
    /// Currently mid-turn: a message was sent and no terminal event seen.
    running: AtomicBool,
    idle_since: StdMutex<Instant>,
    /// Poked on every running/idle transition so the eviction timer
    /// re-evaluates its deadline.
    activity: Notify,
    pending_permissions: StdMutex<HashMap<String, PermissionRequestData>>,
    pending_questions: StdMutex<HashMap<String, QuestionRequestData>>,
}

impl LiveShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            idle_since: StdMutex::new(Instant::now()),
            activity: Notify::new(),
            pending_permissions: StdMutex::new(HashMap::new()),
            pending_questions: StdMutex::new(HashMap::new()),
        }
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if !running {
            *self.idle_since.lock().expect("idle lock") = Instant::now();
        }
        self.activity.notify_one();
    }
}

struct Inner {
    store: Arc<SessionStore>,
    agent: AgentConfig,
    work_dir: PathBuf,
    idle_timeout: Duration,
    live: StdMutex<HashMap<String, LiveSession>>,
    chat_subs: StdMutex<HashMap<String, Vec<ChatSubscriber>>>,
    /// Serializes supervisor starts; never held across the registry mutex.
    start_gate: Mutex<()>,
}

/// Cheap-to-clone facade over the registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        agent: AgentConfig,
        work_dir: PathBuf,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                agent,
                work_dir,
                idle_timeout,
                live: StdMutex::new(HashMap::new()),
                chat_subs: StdMutex::new(HashMap::new()),
                start_gate: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    // ── Store-facing operations ───────────────────────────────────────────────

    pub async fn create(
        &self,
        id: Option<String>,
        title: Option<String>,
        mode: SessionMode,
        work_dir: Option<PathBuf>,
    ) -> Result<SessionMeta, SessionError> {
        let work_dir = work_dir.unwrap_or_else(|| self.inner.work_dir.clone());
        self.inner.store.create(id, title, mode, work_dir).await
    }

    pub async fn list(&self) -> Result<Vec<SessionMeta>, SessionError> {
        self.inner.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<SessionMeta, SessionError> {
        self.inner
            .store
            .load(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Delete a session: close any live handle first, then drop the store
    /// directory (transcript included).
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let live = self.inner.live.lock().expect("registry lock").remove(id);
        if let Some(live) = live {
            live.handle.close().await;
        }
        self.inner.chat_subs.lock().expect("subs lock").remove(id);
        self.inner.store.delete(id).await
    }

    pub async fn update_title(&self, id: &str, title: String) -> Result<SessionMeta, SessionError> {
        self.inner.store.update(id, |m| m.title = title).await
    }

    /// Record a new default mode. A live supervisor keeps the mode it was
    /// started with; the change applies from the next start.
    pub async fn set_mode(&self, id: &str, mode: SessionMode) -> Result<SessionMeta, SessionError> {
        self.inner.store.update(id, |m| m.mode = mode).await
    }

    /// Bump the session's freshness, surfacing it at the top of the list.
    pub async fn activate(&self, id: &str) -> Result<SessionMeta, SessionError> {
        self.inner.store.update(id, |_| {}).await
    }

    pub async fn history(&self, id: &str) -> Result<Vec<AgentEvent>, SessionError> {
        self.inner.store.history(id).await
    }

    // ── Chat surface ──────────────────────────────────────────────────────────

    /// Register a chat subscriber and return the current snapshot.
    pub async fn subscribe_chat(
        &self,
        id: &str,
        subscriber: ChatSubscriber,
    ) -> Result<ChatSnapshot, SessionError> {
        let meta = self.get(id).await?;
        let history = self.inner.store.history(id).await?;
        let running = self
            .inner
            .live
            .lock()
            .expect("registry lock")
            .get(id)
            .map(|l| l.shared.running.load(Ordering::SeqCst))
            .unwrap_or(false);
        self.inner
            .chat_subs
            .lock()
            .expect("subs lock")
            .entry(id.to_string())
            .or_default()
            .push(subscriber);
        Ok(ChatSnapshot {
            history,
            running,
            mode: meta.mode,
        })
    }

    /// Number of live chat subscriptions for a session.
    pub fn chat_subscriber_count(&self, id: &str) -> usize {
        self.inner
            .chat_subs
            .lock()
            .expect("subs lock")
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop one chat subscription. Unknown ids are a no-op (disconnect
    /// cleanup races normal unsubscribes).
    pub fn unsubscribe_chat(&self, id: &str, subscription_id: &str) {
        let mut subs = self.inner.chat_subs.lock().expect("subs lock");
        if let Some(list) = subs.get_mut(id) {
            list.retain(|s| s.id != subscription_id);
            if list.is_empty() {
                subs.remove(id);
            }
        }
    }

    /// Send a user prompt, starting the supervisor if needed. The message
    /// record is appended before delegation so the transcript always shows
    /// what the user asked.
    pub async fn send_message(&self, id: &str, text: &str) -> Result<(), SessionError> {
        let live = self.get_or_start(id).await?;
        self.record(
            id,
            &AgentEvent::Message {
                content: text.to_string(),
            },
        )
        .await;
        let _ = self.inner.store.update(id, |_| {}).await;
        live.shared.set_running(true);
        live.handle.send_message(text).await?;
        Ok(())
    }

    pub async fn permission_response(
        &self,
        id: &str,
        request_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), SessionError> {
        let live = self.live(id)?;
        let data = live
            .shared
            .pending_permissions
            .lock()
            .expect("pending lock")
            .remove(request_id)
            .ok_or_else(|| SessionError::RequestNotFound(request_id.to_string()))?;
        self.record(
            id,
            &AgentEvent::PermissionResponse {
                request_id: request_id.to_string(),
                choice,
            },
        )
        .await;
        live.handle.send_permission_response(&data, choice).await?;
        Ok(())
    }

    /// Answer or cancel (`answers = None`) a pending question.
    pub async fn question_response(
        &self,
        id: &str,
        request_id: &str,
        answers: Option<Vec<String>>,
    ) -> Result<(), SessionError> {
        let live = self.live(id)?;
        let data = live
            .shared
            .pending_questions
            .lock()
            .expect("pending lock")
            .remove(request_id)
            .ok_or_else(|| SessionError::RequestNotFound(request_id.to_string()))?;
        self.record(
            id,
            &AgentEvent::QuestionResponse {
                request_id: request_id.to_string(),
                answers: answers.clone(),
            },
        )
        .await;
        live.handle.send_question_response(&data, answers).await?;
        Ok(())
    }

    pub async fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        let live = self.live(id)?;
        live.handle.send_interrupt().await?;
        Ok(())
    }

    /// Close every live session. Used on shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<LiveSession> = {
            let mut live = self.inner.live.lock().expect("registry lock");
            live.drain().map(|(_, v)| v).collect()
        };
        for live in handles {
            live.handle.close().await;
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn live(&self, id: &str) -> Result<LiveSession, SessionError> {
        self.inner
            .live
            .lock()
            .expect("registry lock")
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn get_or_start(&self, id: &str) -> Result<LiveSession, SessionError> {
        if let Ok(live) = self.live(id) {
            if !live.handle.is_closed() {
                return Ok(live);
            }
        }

        let _gate = self.inner.start_gate.lock().await;
        if let Ok(live) = self.live(id) {
            if !live.handle.is_closed() {
                return Ok(live);
            }
        }

        let meta = match self.inner.store.load(id).await? {
            Some(meta) => meta,
            None => {
                self.inner
                    .store
                    .create(
                        Some(id.to_string()),
                        None,
                        SessionMode::default(),
                        self.inner.work_dir.clone(),
                    )
                    .await?
            }
        };

        let resume = meta.agent_session_id.is_some();
        let native_id = meta
            .agent_session_id
            .clone()
            .unwrap_or_else(|| meta.id.clone());
        let (handle, events) = tether_agent::start(
            &self.inner.agent,
            SpawnOptions {
                workdir: meta.work_dir.clone(),
                session_id: Some(native_id),
                mode: meta.mode,
                resume,
            },
        )?;

        let shared = Arc::new(LiveShared::new());
        let live = LiveSession {
            handle: handle.clone(),
            shared: shared.clone(),
        };
        self.inner
            .live
            .lock()
            .expect("registry lock")
            .insert(id.to_string(), live.clone());

        tokio::spawn(run_pump(
            self.inner.clone(),
            id.to_string(),
            events,
            handle.clone(),
            shared.clone(),
        ));
        tokio::spawn(run_eviction(
            id.to_string(),
            handle,
            shared,
            self.inner.idle_timeout,
        ));

        info!(%id, resume, "session supervisor started");
        Ok(live)
    }

    async fn record(&self, id: &str, event: &AgentEvent) {
        if let Err(err) = self.inner.store.append_event(id, event).await {
            warn!(%id, "transcript append failed: {err}");
        }
    }
}

/// Drain one session's events: transcript first, then fan-out.
async fn run_pump(
    inner: Arc<Inner>,
    id: String,
    mut events: mpsc::Receiver<AgentEvent>,
    handle: AgentHandle,
    shared: Arc<LiveShared>,
) {
    let mut native_recorded = false;
    while let Some(event) = events.recv().await {
        if !native_recorded {
            if let Some(native) = handle.native_session_id() {
                native_recorded = true;
                let result = inner
                    .store
                    .update(&id, |m| m.agent_session_id = Some(native))
                    .await;
                if let Err(err) = result {
                    warn!(%id, "failed to record assistant session id: {err}");
                }
            }
        }

        track_pending(&shared, &event);
        if event.ends_turn() {
            shared.set_running(false);
        }

        if let Err(err) = inner.store.append_event(&id, &event).await {
            warn!(%id, "transcript append failed: {err}");
        }

        // Snapshot the subscriber list; delivery never holds the lock.
        let subs: Vec<ChatSubscriber> = inner
            .chat_subs
            .lock()
            .expect("subs lock")
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let mut dead = Vec::new();
        for sub in &subs {
            let n = event.notification(&id, &sub.id);
            if sub.sink.notify(n).await.is_err() {
                dead.push(sub.id.clone());
            }
        }
        for sub_id in dead {
            debug!(%id, %sub_id, "dropping dead chat subscriber");
            let mut subs = inner.chat_subs.lock().expect("subs lock");
            if let Some(list) = subs.get_mut(&id) {
                list.retain(|s| s.id != sub_id);
            }
        }
    }

    // Event channel closed: the subprocess is gone. Drop the registry entry
    // and make sure the eviction task unparks.
    inner.live.lock().expect("registry lock").remove(&id);
    handle.close().await;
    debug!(%id, "session pump finished");
}

fn track_pending(shared: &LiveShared, event: &AgentEvent) {
    match event {
        AgentEvent::PermissionRequest {
            request_id,
            tool_use_id,
            input,
            suggestions,
            ..
        } => {
            shared.pending_permissions.lock().expect("pending lock").insert(
                request_id.clone(),
                PermissionRequestData {
                    request_id: request_id.clone(),
                    tool_use_id: tool_use_id.clone(),
                    input: input.clone(),
                    suggestions: suggestions.clone(),
                },
            );
        }
        AgentEvent::AskUserQuestion {
            request_id,
            tool_use_id,
            ..
        } => {
            shared.pending_questions.lock().expect("pending lock").insert(
                request_id.clone(),
                QuestionRequestData {
                    request_id: request_id.clone(),
                    tool_use_id: tool_use_id.clone(),
                },
            );
        }
        AgentEvent::RequestCancelled { request_id } => {
            shared
                .pending_permissions
                .lock()
                .expect("pending lock")
                .remove(request_id);
            shared
                .pending_questions
                .lock()
                .expect("pending lock")
                .remove(request_id);
        }
        _ => {}
    }
}

/// Close the supervisor once the session has been idle for `timeout`.
async fn run_eviction(
    id: String,
    handle: AgentHandle,
    shared: Arc<LiveShared>,
    timeout: Duration,
) {
    loop {
        let deadline = if shared.running.load(Ordering::SeqCst) {
            None
        } else {
            Some(*shared.idle_since.lock().expect("idle lock") + timeout)
        };

        tokio::select! {
            _ = handle.closed() => return,
            _ = shared.activity.notified() => continue,
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            } => {
                let idle = !shared.running.load(Ordering::SeqCst)
                    && shared.idle_since.lock().expect("idle lock").elapsed() >= timeout;
                if idle {
                    info!(%id, "evicting idle session");
                    handle.close().await;
                    return;
                }
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
