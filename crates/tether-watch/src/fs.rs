// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Filesystem watcher.
//!
//! Subscriptions are path-scoped. The first subscription for a path arms an
//! OS-level watch (recursive); the last unsubscribe drops it. Raw events
//! are coalesced per watched path inside a 100 ms debounce window, and
//! metadata-only events are ignored so VCS commands that touch mtimes do
//! not feed the watcher back into itself.
//!
//! The `fs.changed` notification carries only the subscription id — the
//! client already knows which path it asked about.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_events::{Notification, NotificationSink};

use crate::subscription::{new_subscription_id, Subscriber};
use crate::{WatchError, FS_PREFIX};

/// Raw events within this window collapse into one notification.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

struct TargetWatch {
    /// Dropping the watcher disarms the OS registration.
    _watcher: RecommendedWatcher,
    subs: Vec<Subscriber>,
}

struct FsInner {
    targets: HashMap<PathBuf, TargetWatch>,
    /// subscription id → watched path, for unsubscribe.
    index: HashMap<String, PathBuf>,
}

/// The filesystem watcher. Cheap to clone.
#[derive(Clone)]
pub struct FsWatcher {
    inner: Arc<StdMutex<FsInner>>,
    raw_tx: mpsc::UnboundedSender<PathBuf>,
    /// Paths currently inside their debounce window.
    pending: Arc<StdMutex<HashSet<PathBuf>>>,
}

impl FsWatcher {
    pub fn new() -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(StdMutex::new(FsInner {
            targets: HashMap::new(),
            index: HashMap::new(),
        }));
        let pending = Arc::new(StdMutex::new(HashSet::new()));
        tokio::spawn(run_debounce(raw_rx, inner.clone(), pending.clone()));
        Self {
            inner,
            raw_tx,
            pending,
        }
    }

    /// Watch `path` (absolute, already resolved against the connection's
    /// worktree binding) and deliver `fs.changed` to `sink`.
    pub fn subscribe(
        &self,
        path: &Path,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<String, WatchError> {
        let id = new_subscription_id(FS_PREFIX);
        let mut inner = self.inner.lock().expect("fs registry lock");

        if let Some(target) = inner.targets.get_mut(path) {
            target.subs.push(Subscriber::new(id.clone(), sink));
        } else {
            let watcher = arm_watch(path, self.raw_tx.clone())?;
            inner.targets.insert(
                path.to_path_buf(),
                TargetWatch {
                    _watcher: watcher,
                    subs: vec![Subscriber::new(id.clone(), sink)],
                },
            );
            debug!(path = %path.display(), "armed filesystem watch");
        }
        inner.index.insert(id.clone(), path.to_path_buf());
        Ok(id)
    }

    /// Drop one subscription; the OS watch goes with the last one.
    pub fn unsubscribe(&self, id: &str) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().expect("fs registry lock");
        let path = inner
            .index
            .remove(id)
            .ok_or_else(|| WatchError::UnknownSubscription(id.to_string()))?;
        if let Some(target) = inner.targets.get_mut(&path) {
            target.subs.retain(|s| s.id != id);
            if target.subs.is_empty() {
                inner.targets.remove(&path);
                debug!(path = %path.display(), "disarmed filesystem watch");
            }
        }
        Ok(())
    }

    /// Whether an OS watch is currently armed for `path`. Test hook.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("fs registry lock")
            .targets
            .contains_key(path)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().expect("fs registry lock").index.len()
    }
}

impl Default for FsWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn arm_watch(
    path: &Path,
    raw_tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher, WatchError> {
    let target = path.to_path_buf();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) if is_relevant(&event.kind) => {
                    // Runs on notify's own thread: hand off to the debouncer.
                    let _ = raw_tx.send(target.clone());
                }
                Ok(_) => {}
                Err(err) => warn!("filesystem watch error: {err}"),
            }
        })?;
    watcher.watch(path, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Metadata-only (chmod/mtime) and access events never notify.
fn is_relevant(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(notify::event::ModifyKind::Metadata(_))
    )
}

async fn run_debounce(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    inner: Arc<StdMutex<FsInner>>,
    pending: Arc<StdMutex<HashSet<PathBuf>>>,
) {
    while let Some(path) = raw_rx.recv().await {
        {
            let mut pending = pending.lock().expect("pending lock");
            if !pending.insert(path.clone()) {
                continue; // already inside the window
            }
        }
        let inner = inner.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            pending.lock().expect("pending lock").remove(&path);

            // Snapshot under the lock, deliver outside it.
            let subs: Vec<Subscriber> = inner
                .lock()
                .expect("fs registry lock")
                .targets
                .get(&path)
                .map(|t| t.subs.clone())
                .unwrap_or_default();
            for sub in subs {
                let n = Notification::new("fs.changed", json!({"subscription_id": sub.id}));
                if sub.sink.notify(n).await.is_err() {
                    debug!(id = %sub.id, "dropping dead fs subscriber");
                    let mut inner = inner.lock().expect("fs registry lock");
                    if let Some(target) = inner.targets.get_mut(&path) {
                        target.subs.retain(|s| s.id != sub.id);
                        if target.subs.is_empty() {
                            inner.targets.remove(&path);
                        }
                    }
                    inner.index.remove(&sub.id);
                }
            }
        });
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
