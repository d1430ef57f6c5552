use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "specwright")]
#[command(version, about = "LLM-assisted specification writing workflow")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Session directory holding state, transcript, and artifacts
    #[arg(long, default_value = ".specwright", global = true)]
    pub session_dir: PathBuf,

    /// Path to the config file
    #[arg(long, default_value = "specwright.toml", global = true)]
    pub config: PathBuf,

    /// Writer model (overrides the config file)
    #[arg(long, global = true)]
    pub writer: Option<String>,

    /// Reviewer models, comma-separated (overrides the config file)
    #[arg(long, global = true)]
    pub reviewers: Option<String>,

    /// Number of review/revise rounds
    #[arg(long, global = true)]
    pub rounds: Option<u32>,

    /// Provider base URL (overrides the config file)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new session: clarify interactively, then draft, review, revise
    Run {
        /// The idea to write a specification for
        idea: String,
    },
    /// Resume a persisted session from wherever it stopped
    Resume,
    /// Show where the session is
    Status,
    /// Reset a failed session, or wipe the session directory with --force
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run { idea } => cmd::cmd_run(&cli, idea).await?,
        Commands::Resume => cmd::cmd_resume(&cli).await?,
        Commands::Status => cmd::cmd_status(&cli)?,
        Commands::Reset { force } => cmd::cmd_reset(&cli, *force)?,
    }
    Ok(())
}
