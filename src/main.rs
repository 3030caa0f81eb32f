mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearth::config::HearthConfig;

#[derive(Parser)]
#[command(name = "hearth", version, about = "Memory and context engine for a conversational companion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show store statistics
    Stats {
        /// Restrict to one owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Semantic search over an owner's memories
    Search {
        owner: String,
        query: String,
        #[arg(long, default_value = "default")]
        persona: String,
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
    /// Print the context block that would be injected for a message
    Context {
        owner: String,
        persona: String,
        message: String,
        /// Print the raw payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the curator now, ignoring cooldown and schedule
    Curate { owner: String, persona: String },
    /// Close stale sessions and run their summaries and ingest
    CloseStale,
    /// Embed memories stored while the embedding provider was unavailable
    Backfill {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Store a pinned, importance-3 fact
    Seed {
        owner: String,
        /// PROFILE, PEOPLE or PROJECT
        #[arg(value_name = "TYPE")]
        memory_type: String,
        content: String,
        /// Entity ref such as person:asha (repeatable)
        #[arg(long = "ref")]
        refs: Vec<String>,
        /// Limit visibility to one persona
        #[arg(long)]
        persona: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = HearthConfig::load()?;

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Stats { owner } => cli::stats::stats(&config, owner.as_deref())?,
        Command::Search {
            owner,
            query,
            persona,
            limit,
        } => cli::search::search(&config, &owner, &persona, &query, limit).await?,
        Command::Context {
            owner,
            persona,
            message,
            json,
        } => cli::context::context(config, &owner, &persona, &message, json).await?,
        Command::Curate { owner, persona } => cli::curate::curate(config, &owner, &persona).await?,
        Command::CloseStale => cli::sessions::close_stale(config).await?,
        Command::Backfill { limit } => cli::backfill::backfill(&config, limit).await?,
        Command::Seed {
            owner,
            memory_type,
            content,
            refs,
            persona,
        } => cli::seed::seed(config, &owner, &memory_type, &content, &refs, persona.as_deref()).await?,
    }

    Ok(())
}
