mod api;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use api::{parse_journal_kind, ApiClient, DEFAULT_BACKEND_URL};
use vigil_backend::database::JournalKind;

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Operator client for the vigil backend")]
struct Cli {
    #[arg(long, env = "VIGIL_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    #[arg(long, env = "VIGIL_BACKEND_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backend and store liveness.
    Health,
    /// Current autonomy mode, tick and checkpoint counters.
    Status,
    /// Most recent entries of one journal.
    Journal {
        kind: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Loaded directives.
    Directives {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Applied migrations and row counts.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,vigil=info")),
        )
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(cli.backend_url, cli.token);
    tracing::debug!("Backend API: {}", client.base_url());

    match cli.command {
        Command::Health => print_json(&client.health().await?),
        Command::Status => print_json(&client.autonomy_status().await?),
        Command::Journal { kind, limit } => {
            let kind = parse_journal_kind(&kind)?;
            print_json(&client.journal(kind, limit).await?)
        }
        Command::Directives { limit } => {
            print_json(&client.journal(JournalKind::Directives, limit).await?)
        }
        Command::Schema => print_json(&client.schema().await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
