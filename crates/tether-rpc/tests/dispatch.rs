// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! End-to-end dispatcher tests over an in-memory transport, with a fake
//! assistant standing in for the real CLI.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use tether_agent::AgentConfig;
use tether_rpc::{memory_pair, protocol, serve, MemoryClient, NodeInfo, Shared, TokenVerifier};
use tether_session::{SessionManager, SessionStore};
use tether_vcs::Vcs;
use tether_watch::{FsWatcher, GitWatcher, SessionListWatcher, WorktreeWatcher};

const TOKEN: &str = "test-token";

struct FixedToken;

impl TokenVerifier for FixedToken {
    fn verify(&self, token: &str) -> bool {
        token == TOKEN
    }
}

fn fake_assistant(dir: &tempfile::TempDir, body: &str) -> AgentConfig {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("assistant.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    AgentConfig {
        program: path,
        base_args: Vec::new(),
    }
}

/// One reply turn per stdin line: a text event and a result.
const ECHO_ASSISTANT: &str = r#"while read -r _l; do
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"OK"}]}}'
printf '%s\n' '{"type":"result","subtype":"success"}'
done"#;

struct Harness {
    _data: tempfile::TempDir,
    work: tempfile::TempDir,
    shared: Arc<Shared>,
}

fn harness(assistant_body: &str) -> Harness {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let agent = fake_assistant(&data, assistant_body);

    let (store, feed) = SessionStore::open(data.path()).unwrap();
    let sessions = SessionManager::new(
        store,
        agent,
        work.path().to_path_buf(),
        Duration::from_secs(60),
    );
    let vcs = Vcs::new(work.path());
    let shared = Arc::new(Shared {
        info: NodeInfo {
            version: "0.4.2-test".into(),
            title: "tether test".into(),
            work_dir: work.path().to_path_buf(),
            agent: "assistant.sh".into(),
        },
        verifier: Arc::new(FixedToken),
        sessions,
        fs_watch: FsWatcher::new(),
        git_watch: GitWatcher::new(vcs.clone()),
        worktree_watch: WorktreeWatcher::new(vcs.clone()),
        session_list_watch: SessionListWatcher::spawn(feed),
        vcs,
        worktree_dir: data.path().join("worktrees"),
    });
    Harness {
        _data: data,
        work,
        shared,
    }
}

/// Client wrapper: sends requests, buffers interleaved notifications.
struct Client {
    inner: MemoryClient,
    notifications: Vec<Value>,
    next_id: i64,
}

impl Client {
    fn connect(shared: Arc<Shared>) -> Self {
        let (client, (source, sink)) = memory_pair();
        tokio::spawn(serve(shared, source, Arc::new(sink)));
        Self {
            inner: client,
            notifications: Vec::new(),
            next_id: 0,
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.inner
            .send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.inner.recv())
                .await
                .expect("timed out waiting for response")
                .expect("server hung up");
            if frame.get("id").map(|v| v == &json!(id)).unwrap_or(false) {
                return frame;
            }
            self.notifications.push(frame);
        }
    }

    async fn auth(&mut self) -> Value {
        self.call("auth", json!({"token": TOKEN})).await
    }

    /// Wait until a buffered or incoming notification matches `pred`.
    async fn wait_notification<F: Fn(&Value) -> bool>(&mut self, what: &str, pred: F) -> Value {
        if let Some(pos) = self.notifications.iter().position(|n| pred(n)) {
            return self.notifications.remove(pos);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.inner.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .expect("server hung up");
            if pred(&frame) {
                return frame;
            }
            self.notifications.push(frame);
        }
    }
}

fn error_code(frame: &Value) -> i64 {
    frame["error"]["code"].as_i64().expect("expected an error")
}

#[tokio::test]
async fn every_method_requires_auth_first() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());

    let resp = client.call("session.list", json!({})).await;
    assert_eq!(error_code(&resp), protocol::UNAUTHENTICATED);

    let resp = client.call("fs.subscribe", json!({"path": ""})).await;
    assert_eq!(error_code(&resp), protocol::UNAUTHENTICATED);
}

#[tokio::test]
async fn invalid_token_is_rejected_and_connection_survives() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());

    let resp = client.call("auth", json!({"token": "wrong"})).await;
    assert_eq!(error_code(&resp), protocol::UNAUTHENTICATED);

    // The server leaves closing to the client: a correct retry succeeds.
    let resp = client.auth().await;
    assert_eq!(resp["result"]["title"], "tether test");
    assert_eq!(resp["result"]["agent"], "assistant.sh");
    assert_eq!(resp["result"]["version"], "0.4.2-test");
}

#[tokio::test]
async fn unknown_method_is_a_structured_error() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());
    client.auth().await;
    let resp = client.call("chat.fly_to_the_moon", json!({})).await;
    assert_eq!(error_code(&resp), protocol::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn session_lifecycle_over_rpc() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());
    client.auth().await;

    let resp = client
        .call("session.create", json!({"id": "s1", "title": "First"}))
        .await;
    assert_eq!(resp["result"]["session"]["id"], "s1");
    assert_eq!(resp["result"]["session"]["mode"], "default");

    let resp = client
        .call("session.update_title", json!({"session_id": "s1", "title": "Renamed"}))
        .await;
    assert_eq!(resp["result"]["session"]["title"], "Renamed");

    let resp = client.call("session.list", json!({})).await;
    let sessions = resp["result"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);

    let resp = client
        .call("session.delete", json!({"session_id": "s1"}))
        .await;
    assert!(resp.get("error").is_none());

    let resp = client
        .call("session.get_history", json!({"session_id": "s1"}))
        .await;
    assert_eq!(error_code(&resp), protocol::NOT_FOUND);
}

#[tokio::test]
async fn chat_flow_delivers_notifications_and_history() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());
    client.auth().await;

    client
        .call("session.create", json!({"id": "s1", "mode": "yolo"}))
        .await;
    let resp = client
        .call("chat.subscribe", json!({"session_id": "s1"}))
        .await;
    let sub_id = resp["result"]["id"].as_str().unwrap().to_string();
    assert!(sub_id.starts_with("c_"));
    assert_eq!(resp["result"]["initial"]["running"], false);
    assert_eq!(resp["result"]["initial"]["mode"], "yolo");
    assert!(resp["result"]["initial"]["history"]
        .as_array()
        .unwrap()
        .is_empty());

    let resp = client
        .call(
            "chat.send_message",
            json!({"session_id": "s1", "text": "Reply with exactly: OK"}),
        )
        .await;
    assert!(resp.get("error").is_none());

    let text = client
        .wait_notification("chat.text", |n| n["method"] == "chat.text")
        .await;
    assert_eq!(text["params"]["text"], "OK");
    assert_eq!(text["params"]["session_id"], "s1");
    assert_eq!(text["params"]["subscription_id"], sub_id.as_str());

    client
        .wait_notification("chat.done", |n| n["method"] == "chat.done")
        .await;

    let resp = client
        .call("session.get_history", json!({"session_id": "s1"}))
        .await;
    let events = resp["result"]["events"].as_array().unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["message", "text", "done"]);
}

#[tokio::test]
async fn fs_watcher_coalesces_over_rpc() {
    let h = harness(ECHO_ASSISTANT);
    let src = h.work.path().join("src");
    std::fs::create_dir(&src).unwrap();

    let mut client = Client::connect(h.shared.clone());
    client.auth().await;

    let resp = client.call("fs.subscribe", json!({"path": "src"})).await;
    let sub_id = resp["result"]["id"].as_str().unwrap().to_string();
    assert!(sub_id.starts_with("w_"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..3 {
        std::fs::write(src.join("main.go"), format!("package main // {i}")).unwrap();
    }

    let n = client
        .wait_notification("fs.changed", |n| n["method"] == "fs.changed")
        .await;
    assert_eq!(n["params"]["subscription_id"], sub_id.as_str());

    // The debounce window has passed; no second notification may arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let resp = client.call("session.list", json!({})).await;
    assert!(resp.get("error").is_none());
    assert!(
        !client.notifications.iter().any(|n| n["method"] == "fs.changed"),
        "three rapid writes must produce exactly one fs.changed"
    );
}

#[tokio::test]
async fn disconnect_releases_every_subscription() {
    let h = harness("cat >/dev/null");
    let mut client = Client::connect(h.shared.clone());
    client.auth().await;

    client.call("session.create", json!({"id": "s1"})).await;
    client.call("fs.subscribe", json!({"path": ""})).await;
    client.call("git.subscribe", json!({})).await;
    client
        .call("chat.subscribe", json!({"session_id": "s1"}))
        .await;

    assert_eq!(h.shared.fs_watch.subscription_count(), 1);
    assert!(h.shared.fs_watch.is_watching(h.work.path()));
    assert!(h.shared.git_watch.is_polling());
    assert_eq!(h.shared.sessions.chat_subscriber_count("s1"), 1);

    // Drop the client: the serve loop sees EOF and cleans up.
    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let cleaned = h.shared.fs_watch.subscription_count() == 0
            && !h.shared.git_watch.is_polling()
            && h.shared.sessions.chat_subscriber_count("s1") == 0;
        if cleaned {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriptions must be released after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        !h.shared.fs_watch.is_watching(h.work.path()),
        "fs watch refcount must reach zero"
    );
}

#[tokio::test]
async fn unsubscribe_rejects_foreign_ids() {
    let h = harness(ECHO_ASSISTANT);
    let mut owner = Client::connect(h.shared.clone());
    owner.auth().await;
    let resp = owner.call("fs.subscribe", json!({"path": ""})).await;
    let sub_id = resp["result"]["id"].as_str().unwrap().to_string();

    let mut intruder = Client::connect(h.shared.clone());
    intruder.auth().await;
    let resp = intruder.call("fs.unsubscribe", json!({"id": sub_id})).await;
    assert_eq!(error_code(&resp), protocol::NOT_FOUND);

    // The owner can still release it.
    let resp = owner.call("fs.unsubscribe", json!({"id": sub_id})).await;
    assert!(resp.get("error").is_none());
}

#[tokio::test]
async fn session_list_subscribe_seeds_and_streams() {
    let h = harness(ECHO_ASSISTANT);
    let mut client = Client::connect(h.shared.clone());
    client.auth().await;

    client.call("session.create", json!({"id": "before"})).await;
    let resp = client.call("session.list.subscribe", json!({})).await;
    let sub_id = resp["result"]["id"].as_str().unwrap().to_string();
    assert!(sub_id.starts_with("sl_"));
    let seed = resp["result"]["initial"]["sessions"].as_array().unwrap();
    assert_eq!(seed.len(), 1);

    client.call("session.create", json!({"id": "after"})).await;
    let n = client
        .wait_notification("session.list.changed", |n| {
            n["method"] == "session.list.changed" && n["params"]["op"] == "created"
        })
        .await;
    assert_eq!(n["params"]["session"]["id"], "after");
    assert_eq!(n["params"]["subscription_id"], sub_id.as_str());
}
