// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node assembly: wire config, store, watchers and the RPC surface
//! together and serve.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tether_agent::AgentConfig;
use tether_rpc::{NodeInfo, Shared};
use tether_session::{SessionManager, SessionStore};
use tether_vcs::Vcs;
use tether_watch::{FsWatcher, GitWatcher, SessionListWatcher, WorktreeWatcher};

use crate::config::NodeConfig;
use crate::token::TokenStore;
use crate::{relay, server};

/// Start the node. This is the single entry point for `tether serve`; it
/// owns the full lifecycle and blocks until the listener stops.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let work_dir = config
        .work_dir()
        .canonicalize()
        .with_context(|| format!("resolving work dir {}", config.work_dir().display()))?;
    let data_dir = config.data_dir();
    let idle_timeout = config.session.idle_timeout()?;

    // ── Token ─────────────────────────────────────────────────────────────────
    let token_store = TokenStore::new(config.token_file());
    let (digest, minted) = token_store.open()?;
    match minted {
        Some(token) => {
            info!("=======================================================");
            info!("Bearer token (shown once — save it now!):");
            info!("  {token}");
            info!("=======================================================");
        }
        None => {
            info!(token_file = %token_store.path().display(), "bearer token loaded");
        }
    }

    // ── Store, sessions, watchers ─────────────────────────────────────────────
    let (store, feed) = SessionStore::open(&data_dir)?;
    let agent = AgentConfig {
        program: PathBuf::from(&config.agent.program),
        base_args: config.agent.args.clone(),
    };
    let sessions = SessionManager::new(store, agent, work_dir.clone(), idle_timeout);
    let vcs = Vcs::new(work_dir.clone());

    let shared = Arc::new(Shared {
        info: NodeInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: config.title(),
            work_dir: work_dir.clone(),
            agent: config.agent.program.clone(),
        },
        verifier: Arc::new(digest),
        sessions,
        fs_watch: FsWatcher::new(),
        git_watch: GitWatcher::new(vcs.clone()),
        worktree_watch: WorktreeWatcher::new(vcs.clone()),
        session_list_watch: SessionListWatcher::spawn(feed),
        vcs,
        worktree_dir: data_dir.join("worktrees"),
    });

    info!(
        work_dir = %work_dir.display(),
        data_dir = %data_dir.display(),
        agent = %config.agent.program,
        idle_timeout = %config.session.idle_timeout,
        "node assembled"
    );

    // ── Relay (optional) ──────────────────────────────────────────────────────
    if let Some(url) = config.relay.url.clone() {
        info!(%url, "relay enabled");
        tokio::spawn(relay::run(url, shared.clone()));
    }

    // ── WebSocket listener (blocks until shutdown) ────────────────────────────
    server::serve_http(&config.http.bind, shared).await
}

/// Regenerate the bearer token, printing the new raw token once.
/// Called by `tether token regenerate`.
pub fn regenerate_token(config: &NodeConfig) -> anyhow::Result<()> {
    let token = TokenStore::new(config.token_file()).rotate()?;
    println!("New bearer token (save it now — it won't be shown again):");
    println!("  {token}");
    Ok(())
}
