// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, TokenCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = tether_node::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        None => tether_node::run(config).await,
        Some(Commands::Serve { bind, work_dir }) => {
            if let Some(bind) = bind {
                config.http.bind = bind;
            }
            if let Some(work_dir) = work_dir {
                config.work_dir = Some(work_dir);
            }
            tether_node::run(config).await
        }
        Some(Commands::Token { command }) => match command {
            TokenCommands::Regenerate => tether_node::node::regenerate_token(&config),
        },
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
    }
}

/// Logging goes to stderr. `TETHER_LOG` takes precedence; `--verbose`
/// raises the default from `info` to `debug`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("TETHER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
