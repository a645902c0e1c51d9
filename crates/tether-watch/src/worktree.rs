// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Worktree-list watcher: a 3 s poll of `git worktree list --porcelain`.
//!
//! Any textual change notifies every subscriber with `worktree.changed`; a
//! worktree that disappears from the listing additionally produces one
//! `worktree.deleted` carrying its name, so connections bound to it can
//! fall back to the main checkout.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_events::{Notification, NotificationSink};
use tether_vcs::Vcs;

use crate::subscription::{new_subscription_id, Subscriber};
use crate::{WatchError, WORKTREE_PREFIX};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct WorktreeState {
    subs: Vec<Subscriber>,
    poller: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct WorktreeWatcher {
    vcs: Vcs,
    interval: Duration,
    state: Arc<StdMutex<WorktreeState>>,
}

impl WorktreeWatcher {
    pub fn new(vcs: Vcs) -> Self {
        Self::with_interval(vcs, POLL_INTERVAL)
    }

    pub fn with_interval(vcs: Vcs, interval: Duration) -> Self {
        Self {
            vcs,
            interval,
            state: Arc::new(StdMutex::new(WorktreeState {
                subs: Vec::new(),
                poller: None,
            })),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) -> String {
        let id = new_subscription_id(WORKTREE_PREFIX);
        let mut state = self.state.lock().expect("worktree watch lock");
        state.subs.push(Subscriber::new(id.clone(), sink));
        if state.poller.is_none() {
            debug!("starting worktree poller");
            state.poller = Some(tokio::spawn(run_poll(
                self.vcs.clone(),
                self.interval,
                self.state.clone(),
            )));
        }
        id
    }

    pub fn unsubscribe(&self, id: &str) -> Result<(), WatchError> {
        let mut state = self.state.lock().expect("worktree watch lock");
        let before = state.subs.len();
        state.subs.retain(|s| s.id != id);
        if state.subs.len() == before {
            return Err(WatchError::UnknownSubscription(id.to_string()));
        }
        if state.subs.is_empty() {
            if let Some(poller) = state.poller.take() {
                debug!("stopping worktree poller");
                poller.abort();
            }
        }
        Ok(())
    }

    pub fn is_polling(&self) -> bool {
        self.state
            .lock()
            .expect("worktree watch lock")
            .poller
            .is_some()
    }
}

async fn run_poll(vcs: Vcs, interval: Duration, state: Arc<StdMutex<WorktreeState>>) {
    let mut last = vcs.worktree_listing().await.unwrap_or_else(|err| {
        warn!("initial worktree listing failed: {err}");
        String::new()
    });
    loop {
        tokio::time::sleep(interval).await;
        let next = match vcs.worktree_listing().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!("worktree listing failed: {err}");
                continue;
            }
        };
        if next == last {
            continue;
        }
        let removed = removed_names(&last, &next);
        last = next;

        let subs: Vec<Subscriber> = state.lock().expect("worktree watch lock").subs.clone();
        for sub in &subs {
            let n = Notification::new("worktree.changed", json!({"subscription_id": sub.id}));
            if sub.sink.notify(n).await.is_err() {
                state
                    .lock()
                    .expect("worktree watch lock")
                    .subs
                    .retain(|s| s.id != sub.id);
                continue;
            }
            for name in &removed {
                let n = Notification::new(
                    "worktree.deleted",
                    json!({"subscription_id": sub.id, "name": name}),
                );
                let _ = sub.sink.notify(n).await;
            }
        }
    }
}

/// Worktree names present in `old` but gone from `new`. The first
/// `worktree` line of a listing is the main checkout and is never named.
pub(crate) fn removed_names(old: &str, new: &str) -> Vec<String> {
    let old_names = listed_names(old);
    let new_names = listed_names(new);
    old_names.difference(&new_names).cloned().collect()
}

fn listed_names(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter_map(|l| l.strip_prefix("worktree "))
        .skip(1)
        .filter_map(|p| {
            PathBuf::from(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .collect()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
