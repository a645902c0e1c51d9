// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! VCS status watcher.
//!
//! Whole-scope: one fingerprint per repository, every subscriber notified
//! once per change. Polling is deliberate — OS-level "the repo changed"
//! signals are not portable, and the fingerprint comparison debounces the
//! churn git itself causes (index touches, lock files).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_events::{Notification, NotificationSink};
use tether_vcs::Vcs;

use crate::subscription::{new_subscription_id, Subscriber};
use crate::{WatchError, GIT_PREFIX};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct GitState {
    subs: Vec<Subscriber>,
    /// Present while at least one subscriber exists.
    poller: Option<JoinHandle<()>>,
}

/// Poll-based watcher over one repository's status fingerprint.
#[derive(Clone)]
pub struct GitWatcher {
    vcs: Vcs,
    interval: Duration,
    state: Arc<StdMutex<GitState>>,
}

impl GitWatcher {
    pub fn new(vcs: Vcs) -> Self {
        Self::with_interval(vcs, POLL_INTERVAL)
    }

    pub fn with_interval(vcs: Vcs, interval: Duration) -> Self {
        Self {
            vcs,
            interval,
            state: Arc::new(StdMutex::new(GitState {
                subs: Vec::new(),
                poller: None,
            })),
        }
    }

    /// Subscribe; the first subscription starts the poll loop.
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) -> String {
        let id = new_subscription_id(GIT_PREFIX);
        let mut state = self.state.lock().expect("git watch lock");
        state.subs.push(Subscriber::new(id.clone(), sink));
        if state.poller.is_none() {
            debug!("starting git status poller");
            state.poller = Some(tokio::spawn(run_poll(
                self.vcs.clone(),
                self.interval,
                self.state.clone(),
            )));
        }
        id
    }

    /// Drop one subscription; the poll loop stops with the last one.
    pub fn unsubscribe(&self, id: &str) -> Result<(), WatchError> {
        let mut state = self.state.lock().expect("git watch lock");
        let before = state.subs.len();
        state.subs.retain(|s| s.id != id);
        if state.subs.len() == before {
            return Err(WatchError::UnknownSubscription(id.to_string()));
        }
        if state.subs.is_empty() {
            if let Some(poller) = state.poller.take() {
                debug!("stopping git status poller");
                poller.abort();
            }
        }
        Ok(())
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().expect("git watch lock").poller.is_some()
    }
}

async fn run_poll(vcs: Vcs, interval: Duration, state: Arc<StdMutex<GitState>>) {
    let mut last = match vcs.fingerprint().await {
        Ok(fp) => fp,
        Err(err) => {
            warn!("initial git fingerprint failed: {err}");
            String::new()
        }
    };
    loop {
        tokio::time::sleep(interval).await;
        let next = match vcs.fingerprint().await {
            Ok(fp) => fp,
            Err(err) => {
                warn!("git fingerprint failed: {err}");
                continue;
            }
        };
        if next == last {
            continue;
        }
        last = next;

        let subs: Vec<Subscriber> = state.lock().expect("git watch lock").subs.clone();
        for sub in subs {
            let n = Notification::new("git.changed", json!({"subscription_id": sub.id}));
            if sub.sink.notify(n).await.is_err() {
                state
                    .lock()
                    .expect("git watch lock")
                    .subs
                    .retain(|s| s.id != sub.id);
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as TestMutex;
    use tether_events::SinkClosed;

    struct Recorder(TestMutex<Vec<Notification>>);

    #[async_trait::async_trait]
    impl NotificationSink for Recorder {
        async fn notify(&self, n: Notification) -> Result<(), SinkClosed> {
            self.0.lock().unwrap().push(n);
            Ok(())
        }
    }

    #[tokio::test]
    async fn poller_arms_on_first_and_disarms_on_last() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = GitWatcher::new(Vcs::new(dir.path()));
        assert!(!watcher.is_polling());

        let sink = Arc::new(Recorder(TestMutex::new(Vec::new())));
        let a = watcher.subscribe(sink.clone());
        let b = watcher.subscribe(sink.clone());
        assert!(watcher.is_polling());

        watcher.unsubscribe(&a).unwrap();
        assert!(watcher.is_polling());
        watcher.unsubscribe(&b).unwrap();
        assert!(!watcher.is_polling());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = GitWatcher::new(Vcs::new(dir.path()));
        assert!(matches!(
            watcher.unsubscribe("g_nope"),
            Err(WatchError::UnknownSubscription(_))
        ));
    }
}
