// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node configuration loaded from YAML.
//!
//! Configuration is YAML; layers are **deep-merged** so each file only
//! overrides the fields it cares about.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/tether/config.yaml`
//! 2. `~/.config/tether/config.yaml`
//! 3. `.tether/config.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! **All defaults are production-safe**: loopback bind, token required,
//! ten-minute idle eviction, relay off.
//!
//! # Example full config
//! ```yaml
//! http:
//!   bind: "127.0.0.1:18790"
//!   token_file: "~/.local/share/tether/token.yaml"
//!
//! agent:
//!   program: claude
//!   args: []
//!
//! session:
//!   idle_timeout: 10m
//!
//! relay:
//!   url: "wss://relay.example.com/tunnel"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}
fn default_idle_timeout() -> String {
    "10m".to_string()
}
fn default_program() -> String {
    "claude".to_string()
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub relay: RelaySection,

    /// The directory the assistant works against. Default: the node's CWD.
    pub work_dir: Option<PathBuf>,

    /// Where sessions, worktrees and the token live.
    /// Default: `~/.local/share/tether`.
    pub data_dir: Option<PathBuf>,

    /// Human title reported by `auth`. Default: the work dir's name.
    pub title: Option<String>,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:18790` (loopback only).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path to the YAML file storing the SHA-256 hashed bearer token.
    /// Default: `<data_dir>/token.yaml`.
    pub token_file: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token_file: None,
        }
    }
}

/// How to launch the assistant CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// The assistant executable; resolved via PATH when relative.
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra arguments placed before the stream-JSON flags.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
        }
    }
}

/// Session lifecycle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Idle eviction delay, in the usual duration grammar (`90s`, `10m`,
    /// `2h 30m`). Default: `10m`.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl SessionSection {
    pub fn idle_timeout(&self) -> anyhow::Result<Duration> {
        humantime::parse_duration(&self.idle_timeout)
            .with_context(|| format!("invalid session.idle_timeout {:?}", self.idle_timeout))
    }
}

/// Optional cloud relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySection {
    /// Outbound trunk URL (`wss://…`). Absent = relay disabled.
    pub url: Option<String>,
}

impl NodeConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tether")
        })
    }

    pub fn token_file(&self) -> PathBuf {
        self.http
            .token_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("token.yaml"))
    }

    pub fn title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.work_dir()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tether".to_string())
        })
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

/// Load the effective configuration.
///
/// Every candidate file that exists becomes one layer, strongest last; the
/// explicit path (from `--config`) is the strongest of all and, unlike the
/// well-known locations, must exist.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut candidates: Vec<(PathBuf, bool)> =
        vec![(PathBuf::from("/etc/tether/config.yaml"), false)];
    if let Some(home) = dirs::home_dir() {
        candidates.push((home.join(".config/tether/config.yaml"), false));
    }
    candidates.push((PathBuf::from(".tether/config.yaml"), false));
    if let Some(path) = explicit {
        candidates.push((path.to_path_buf(), true));
    }

    let mut effective = serde_yaml::Value::Null;
    for (path, required) in candidates {
        if !required && !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        debug!("applying config layer {}", path.display());
        effective = overlay(effective, layer);
    }

    if effective.is_null() {
        return Ok(NodeConfig::default());
    }
    serde_yaml::from_value(effective).context("interpreting merged configuration")
}

/// Merge one layer over a base, field by field. Mappings combine
/// recursively; any other pair resolves in the layer's favor, so a scalar
/// in a later file replaces a whole subtree from an earlier one.
fn overlay(base: serde_yaml::Value, layer: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value::Mapping;
    match (base, layer) {
        (Mapping(mut under), Mapping(over)) => {
            for (key, value) in over {
                let merged = match under.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                under.insert(key, merged);
            }
            Mapping(under)
        }
        (_, layer) => layer,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
