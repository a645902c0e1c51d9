// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session-list watcher.
//!
//! The only watcher that does not poll: the session store publishes every
//! create/update/delete into a bounded feed, and a dedicated drainer turns
//! each change into a `session.list.changed` notification.
//!
//! When the feed overflows, some changes are already lost — pushing on
//! would leave clients silently out of sync. Instead every subscriber is
//! torn down with one `session.list.resync` notification and dropped;
//! re-subscribing returns a fresh seed list.

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tracing::{debug, warn};

use tether_events::{Notification, NotificationSink};
use tether_session::{ChangeFeed, SessionListChange};

use crate::subscription::{new_subscription_id, Subscriber};
use crate::{WatchError, SESSION_LIST_PREFIX};

/// Error code carried by the forced-resync notification.
pub(crate) const RESYNC_CODE: i64 = -32003;

#[derive(Clone)]
pub struct SessionListWatcher {
    subs: Arc<StdMutex<Vec<Subscriber>>>,
}

impl SessionListWatcher {
    /// Spawn the drainer over the store's change feed.
    pub fn spawn(feed: ChangeFeed) -> Self {
        let subs = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(run_drain(feed, subs.clone()));
        Self { subs }
    }

    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) -> String {
        let id = new_subscription_id(SESSION_LIST_PREFIX);
        self.subs
            .lock()
            .expect("session-list lock")
            .push(Subscriber::new(id.clone(), sink));
        id
    }

    pub fn unsubscribe(&self, id: &str) -> Result<(), WatchError> {
        let mut subs = self.subs.lock().expect("session-list lock");
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(WatchError::UnknownSubscription(id.to_string()));
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().expect("session-list lock").len()
    }
}

async fn run_drain(mut feed: ChangeFeed, subs: Arc<StdMutex<Vec<Subscriber>>>) {
    loop {
        tokio::select! {
            change = feed.changes.recv() => {
                let Some(change) = change else { break };
                deliver(&subs, &change).await;
            }
            _ = feed.overflow.notified() => {
                // The feed lost changes; drain whatever is still queued and
                // force every subscriber to re-seed.
                while feed.changes.try_recv().is_ok() {}
                let dropped: Vec<Subscriber> = {
                    let mut subs = subs.lock().expect("session-list lock");
                    subs.drain(..).collect()
                };
                warn!(
                    subscribers = dropped.len(),
                    "session-list feed overflowed, forcing resync"
                );
                for sub in dropped {
                    let n = Notification::new(
                        "session.list.resync",
                        json!({"subscription_id": sub.id, "code": RESYNC_CODE}),
                    );
                    let _ = sub.sink.notify(n).await;
                }
            }
        }
    }
    debug!("session-list drainer stopped");
}

async fn deliver(subs: &Arc<StdMutex<Vec<Subscriber>>>, change: &SessionListChange) {
    let snapshot: Vec<Subscriber> = subs.lock().expect("session-list lock").clone();
    for sub in snapshot {
        let mut params = serde_json::to_value(change).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = params {
            map.insert("subscription_id".into(), json!(sub.id));
        }
        let n = Notification::new("session.list.changed", params);
        if sub.sink.notify(n).await.is_err() {
            subs.lock()
                .expect("session-list lock")
                .retain(|s| s.id != sub.id);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as TestMutex;
    use std::time::Duration;
    use tether_events::{SessionMode, SinkClosed};
    use tether_session::{SessionStore, CHANGE_FEED_DEPTH};

    struct Recorder(TestMutex<Vec<Notification>>);

    #[async_trait::async_trait]
    impl NotificationSink for Recorder {
        async fn notify(&self, n: Notification) -> Result<(), SinkClosed> {
            self.0.lock().unwrap().push(n);
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn store_changes_reach_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (store, feed) = SessionStore::open(dir.path()).unwrap();
        let watcher = SessionListWatcher::spawn(feed);

        let sink = Arc::new(Recorder(TestMutex::new(Vec::new())));
        let id = watcher.subscribe(sink.clone());

        store
            .create(Some("s1".into()), None, SessionMode::Default, "/tmp".into())
            .await
            .unwrap();
        wait_for("created notification", || !sink.0.lock().unwrap().is_empty()).await;

        let got = sink.0.lock().unwrap();
        assert_eq!(got[0].method, "session.list.changed");
        assert_eq!(got[0].params["op"], "created");
        assert_eq!(got[0].params["session"]["id"], "s1");
        assert_eq!(got[0].params["subscription_id"], id);
    }

    #[tokio::test]
    async fn delete_notification_carries_only_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let (store, feed) = SessionStore::open(dir.path()).unwrap();
        let watcher = SessionListWatcher::spawn(feed);
        let sink = Arc::new(Recorder(TestMutex::new(Vec::new())));
        watcher.subscribe(sink.clone());

        store
            .create(Some("s1".into()), None, SessionMode::Default, "/tmp".into())
            .await
            .unwrap();
        store.delete("s1").await.unwrap();

        wait_for("delete notification", || {
            sink.0
                .lock()
                .unwrap()
                .iter()
                .any(|n| n.params["op"] == "deleted")
        })
        .await;
        let got = sink.0.lock().unwrap();
        let deleted = got.iter().find(|n| n.params["op"] == "deleted").unwrap();
        assert_eq!(deleted.params["id"], "s1");
        assert!(deleted.params.get("session").is_none());
    }

    #[tokio::test]
    async fn overflow_tears_subscribers_down_with_resync() {
        let dir = tempfile::tempdir().unwrap();
        let (store, feed) = SessionStore::open(dir.path()).unwrap();

        // Fill the feed past capacity before the drainer exists, so the
        // overflow signal is guaranteed to fire.
        for i in 0..(CHANGE_FEED_DEPTH + 5) {
            store
                .create(Some(format!("s{i}")), None, SessionMode::Default, "/tmp".into())
                .await
                .unwrap();
        }

        let watcher = SessionListWatcher::spawn(feed);
        let sink = Arc::new(Recorder(TestMutex::new(Vec::new())));
        watcher.subscribe(sink.clone());

        wait_for("resync notification", || {
            sink.0
                .lock()
                .unwrap()
                .iter()
                .any(|n| n.method == "session.list.resync")
        })
        .await;
        assert_eq!(watcher.subscriber_count(), 0, "subscribers are torn down");

        let got = sink.0.lock().unwrap();
        let resync = got
            .iter()
            .find(|n| n.method == "session.list.resync")
            .unwrap();
        assert_eq!(resync.params["code"], RESYNC_CODE);
    }
}
