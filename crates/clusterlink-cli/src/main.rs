//! clusterlink CLI — run the agent and manage its credentials.

mod cli;
mod cmd;

use clap::Parser;
use cli::{Cli, Commands, SecretCommands};

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = clusterlink_agent::load_config(cli.config.as_deref());
    let result = match cli.command {
        Commands::Run => cmd::run::cmd_run(config),
        Commands::Secret(SecretCommands::Show) => cmd::secret::cmd_show(&config),
        Commands::Secret(SecretCommands::Set { hex }) => cmd::secret::cmd_set(&config, &hex),
        Commands::Secret(SecretCommands::Rotate) => cmd::secret::cmd_rotate(&config),
        Commands::Directory { json } => cmd::directory::cmd_directory(&config, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
