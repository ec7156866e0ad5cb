//! kbqa command-line tool.
//!
//! Runs the HTTP service, answers one-off questions and manages the
//! knowledge store and its index.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use commands::{AskCommand, IndexCommand, KbCommand, ServeCommand};
use kbqa_core::{config::AppConfig, logging};
use std::path::PathBuf;

/// Question answering over a curated knowledge base
#[derive(Parser, Debug)]
#[command(name = "kbqa")]
#[command(about = "Question answering over a curated knowledge base", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to workspace directory (default: current directory)
    #[arg(short, long, global = true, env = "KBQA_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true, env = "KBQA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    no_color: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service
    Serve(ServeCommand),

    /// Answer one question from the command line
    Ask(AskCommand),

    /// Inspect or rebuild the vector index
    Index(IndexCommand),

    /// Manage knowledge entries
    Kb(KbCommand),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Serve(_) => "serve",
            Commands::Ask(_) => "ask",
            Commands::Index(_) => "index",
            Commands::Kb(_) => "kb",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_with(cli.workspace, cli.config)
        .context("Failed to load configuration")?
        .with_overrides(
            None,
            None,
            cli.log_level,
            cli.verbose,
            cli.no_color,
            cli.json_logs,
        );

    logging::init_logging(
        config.logging.level.as_deref(),
        config.no_color(),
        config.logging.json,
    )?;

    tracing::debug!(workspace = %config.workspace.display(), "Configuration loaded");

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.execute(&config).await,
        Commands::Ask(cmd) => cmd.execute(&config).await,
        Commands::Index(cmd) => cmd.execute(&config).await,
        Commands::Kb(cmd) => cmd.execute(&config).await,
    };

    match &result {
        Ok(()) => tracing::debug!("Command completed"),
        Err(e) => tracing::error!(kind = e.kind(), error = %e, "Command failed"),
    }

    Ok(result?)
}
