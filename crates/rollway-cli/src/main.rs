use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use rollway_core::Channel;

mod commands;
mod completion;
mod render;
mod settings;

#[derive(Parser, Debug)]
#[command(name = "rollway")]
#[command(
    about = "Install, activate, health-check and roll back versions of one service",
    long_about = None
)]
struct Cli {
    /// Data directory (default: $ROLLWAY_DATA_DIR, then ~/.rollway).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log more; repeat for debug output.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install and activate a version.
    Install { version: String },
    /// Re-activate the previous version.
    Rollback,
    /// List installed versions.
    List,
    /// Print the active version.
    Current,
    /// List versions published on a channel.
    Available {
        #[arg(long, value_parser = parse_channel_arg)]
        channel: Option<Channel>,
    },
    /// Report whether a newer version is published.
    Check {
        #[arg(long, value_parser = parse_channel_arg)]
        channel: Option<Channel>,
    },
    /// Install the newest version when auto_update is enabled.
    AutoUpdate,
    Changelog { version: String },
    /// Delete installed versions outside the retention window.
    Prune {
        #[arg(long)]
        keep: Option<usize>,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    Status,
    /// Clear the marker left by a failed transition.
    Repair,
    Completions { shell: Shell },
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    Show,
    Set {
        #[arg(long, value_parser = parse_channel_arg)]
        channel: Option<Channel>,
        #[arg(long)]
        keep_count: Option<usize>,
        #[arg(long)]
        auto_update: Option<bool>,
        #[arg(long)]
        update_server: Option<String>,
        #[arg(long)]
        health_url: Option<String>,
    },
}

fn parse_channel_arg(value: &str) -> std::result::Result<Channel, String> {
    Channel::parse(value).ok_or_else(|| {
        format!("unknown channel '{value}' (expected one of: stable, beta, dev)")
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    commands::init_tracing(cli.verbose);
    commands::run_cli(cli)
}

#[cfg(test)]
mod tests;
