//! Clap CLI definitions for clusterlink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1mHint:\x1b[0m Commands suffixed with [*] have subcommands. Run `<command> --help` for details.

\x1b[1;36mExamples:\x1b[0m
  clusterlink secret rotate     Generate a new shared secret
  clusterlink directory         List the region's event-loops
  clusterlink run               Start the agent";

/// Cluster agent: keeps secure RPC channels open to the region's event-loops.
#[derive(Parser)]
#[command(name = "clusterlink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent until interrupted.
    Run,
    /// Manage the shared secret (show, set, rotate) [*].
    #[command(subcommand)]
    Secret(SecretCommands),
    /// Fetch and print the region's event-loop directory.
    Directory {
        /// Print the raw JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Print the shared secret as hex.
    Show,
    /// Install a shared secret given as hex.
    Set {
        /// The secret, hex-encoded.
        hex: String,
    },
    /// Replace the shared secret with a freshly generated one.
    Rotate,
}
