// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! On-disk session store.
//!
//! Layout under the data directory:
//!
//! ```text
//! sessions/<id>/meta.yaml         # SessionMeta
//! sessions/<id>/transcript.jsonl  # one persisted AgentEvent record per line
//! ```
//!
//! The transcript is append-only and never rewritten. Every create, update
//! and delete is published into a bounded change feed consumed by the
//! session-list watcher; when the feed overflows, the overflow signal fires
//! and subscribers are forced to re-sync instead of silently missing state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use tether_events::{AgentEvent, SessionMode};

use crate::SessionError;

/// Capacity of the session-list change feed.
pub const CHANGE_FEED_DEPTH: usize = 64;

/// Persisted per-session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub mode: SessionMode,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The assistant's own session id, recorded from its init line.
    /// Presence means the next start resumes instead of assigning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// One session-list mutation, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionListChange {
    Created { session: SessionMeta },
    Updated { session: SessionMeta },
    Deleted { id: String },
}

/// Receiving side of the change feed, owned by the session-list watcher.
pub struct ChangeFeed {
    pub changes: mpsc::Receiver<SessionListChange>,
    /// Fired when a change had to be dropped; subscribers must re-seed.
    pub overflow: Arc<Notify>,
}

/// The store. Cheap to share behind an [`Arc`].
pub struct SessionStore {
    root: PathBuf,
    changes: mpsc::Sender<SessionListChange>,
    overflow: Arc<Notify>,
}

impl SessionStore {
    /// Open (creating if needed) the store under `data_dir/sessions`.
    pub fn open(data_dir: &Path) -> Result<(Arc<Self>, ChangeFeed), SessionError> {
        let root = data_dir.join("sessions");
        std::fs::create_dir_all(&root).map_err(|source| SessionError::Io {
            path: root.clone(),
            source,
        })?;
        let (tx, rx) = mpsc::channel(CHANGE_FEED_DEPTH);
        let overflow = Arc::new(Notify::new());
        let store = Arc::new(Self {
            root,
            changes: tx,
            overflow: overflow.clone(),
        });
        Ok((
            store,
            ChangeFeed {
                changes: rx,
                overflow,
            },
        ))
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir(id).join("meta.yaml")
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.dir(id).join("transcript.jsonl")
    }

    /// Create a session. A missing `id` gets a fresh UUID.
    pub async fn create(
        &self,
        id: Option<String>,
        title: Option<String>,
        mode: SessionMode,
        work_dir: PathBuf,
    ) -> Result<SessionMeta, SessionError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let meta = SessionMeta {
            title: title.unwrap_or_else(|| format!("Session {}", &id[..id.len().min(8)])),
            id,
            mode,
            work_dir,
            created_at: now,
            updated_at: now,
            agent_session_id: None,
        };
        self.write_meta(&meta).await?;
        debug!(id = %meta.id, "session created");
        self.publish(SessionListChange::Created {
            session: meta.clone(),
        });
        Ok(meta)
    }

    pub async fn load(&self, id: &str) -> Result<Option<SessionMeta>, SessionError> {
        let path = self.meta_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        let meta = serde_yaml::from_str(&text).map_err(|source| SessionError::Meta {
            id: id.to_string(),
            source,
        })?;
        Ok(Some(meta))
    }

    /// Load, apply `mutate`, bump `updated_at`, save, publish `Updated`.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<SessionMeta, SessionError>
    where
        F: FnOnce(&mut SessionMeta),
    {
        let mut meta = self
            .load(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        mutate(&mut meta);
        meta.updated_at = Utc::now();
        self.write_meta(&meta).await?;
        self.publish(SessionListChange::Updated {
            session: meta.clone(),
        });
        Ok(meta)
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionMeta>, SessionError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| SessionError::Io {
                path: self.root.clone(),
                source,
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id).await {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(err) => warn!(%id, "skipping unreadable session: {err}"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let dir = self.dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                self.publish(SessionListChange::Deleted { id: id.to_string() });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(id.to_string()))
            }
            Err(source) => Err(SessionError::Io { path: dir, source }),
        }
    }

    /// Append one event record to the transcript.
    pub async fn append_event(&self, id: &str, event: &AgentEvent) -> Result<(), SessionError> {
        let path = self.transcript_path(id);
        let mut line = event.to_record().to_string();
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SessionError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| SessionError::Io { path, source })
    }

    /// Read the transcript back, in append order. Unparseable lines are
    /// skipped with a warning — history replay must never fail wholesale.
    pub async fn history(&self, id: &str) -> Result<Vec<AgentEvent>, SessionError> {
        if self.load(id).await?.is_none() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let path = self.transcript_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line).map(AgentEvent::from_record) {
                Ok(Ok(ev)) => events.push(ev),
                _ => warn!(%id, "skipping corrupt transcript line"),
            }
        }
        Ok(events)
    }

    fn publish(&self, change: SessionListChange) {
        use mpsc::error::TrySendError;
        match self.changes.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(change)) => {
                // Dropping silently would desynchronize clients; the
                // watcher reacts to this signal by forcing a re-sync.
                warn!(?change, "session-list change feed full, forcing resync");
                self.overflow.notify_one();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn write_meta(&self, meta: &SessionMeta) -> Result<(), SessionError> {
        let dir = self.dir(&meta.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SessionError::Io {
                path: dir.clone(),
                source,
            })?;
        let yaml = serde_yaml::to_string(meta).map_err(|source| SessionError::Meta {
            id: meta.id.clone(),
            source,
        })?;
        let path = self.meta_path(&meta.id);
        tokio::fs::write(&path, yaml)
            .await
            .map_err(|source| SessionError::Io { path, source })
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
