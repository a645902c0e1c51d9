// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// Tether — drive a coding-assistant CLI from anywhere.
///
/// The node supervises assistant sessions against a working directory and
/// exposes them to remote clients over an authenticated WebSocket.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
pub struct Cli {
    /// Path to the node config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (or set TETHER_LOG).
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node (the default when no subcommand is given).
    ///
    /// A bearer token is generated on first run and printed once; clients
    /// must present it in their `auth` call.
    Serve {
        /// Override the listen address, e.g. `127.0.0.1:18790`.
        #[arg(long)]
        bind: Option<String>,

        /// Override the working directory the assistant operates on.
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Bearer token management.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Print the effective configuration and exit.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Regenerate the bearer token. The old token is invalidated
    /// immediately; the new one is printed once.
    Regenerate,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::parse_from(["tether", "serve", "--bind", "0.0.0.0:9000"]);
        match cli.command {
            Some(Commands::Serve { bind, .. }) => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("expected Serve, got {other:?}"),
        }
    }

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::parse_from(["tether"]);
        assert!(cli.command.is_none());
    }
}
