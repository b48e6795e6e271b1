use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flume::unbounded;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vigil_backend::config::BackendConfig;
use vigil_backend::database::JournalStore;
use vigil_backend::importer::{TranscriptImporter, TranscriptWatcher};
use vigil_backend::runtime::BackendRuntime;

#[derive(Debug, Parser)]
#[command(name = "vigil_backend", version, about = "Presence-aware journal daemon")]
struct Cli {
    /// Journal database file (overrides the config file).
    #[arg(long, env = "VIGIL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Config file to load instead of ~/.vigil/vigil_config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import exported chat-session transcripts into the chat journal.
    Import {
        /// Keep syncing the newest session-*.json in this directory until interrupted.
        #[arg(long, value_name = "DIR")]
        watch: Option<PathBuf>,
        #[arg(required_unless_present = "watch")]
        files: Vec<PathBuf>,
    },
    /// Write the effective configuration to the config file.
    InitConfig {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vigil_backend=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BackendConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.db_path {
        config.database_path = path.display().to_string();
    }

    match cli.command {
        Some(Command::Import { watch, files }) => import(&config, &files, watch),
        Some(Command::InitConfig { force }) => {
            let path = cli.config.unwrap_or_else(BackendConfig::config_path);
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to replace it)", path);
            }
            config.save(&path)
        }
        None => serve(config),
    }
}

fn import(config: &BackendConfig, files: &[PathBuf], watch: Option<PathBuf>) -> Result<()> {
    let store = JournalStore::open(&config.database_path)
        .with_context(|| format!("Failed to open journal store {}", config.database_path))?;
    let mut importer = TranscriptImporter::new(Arc::new(store))?;

    let mut imported = 0;
    for file in files {
        imported += importer.import_file(file)?.imported;
    }
    if !files.is_empty() {
        tracing::info!("Import finished: {} new chat entries", imported);
    }

    let Some(dir) = watch else {
        return Ok(());
    };
    let rt = tokio::runtime::Runtime::new().context("failed to start watcher runtime")?;
    rt.block_on(async move {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_cancel.cancel();
        });
        TranscriptWatcher::new(importer, dir, config.transcript_poll_interval())
            .run(cancel)
            .await;
    });
    Ok(())
}

fn serve(config: BackendConfig) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to start backend runtime")?;
    rt.block_on(async move {
        let (event_tx, event_rx) = unbounded();
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap backend runtime")?;

        tracing::info!(
            "Starting vigil backend (the API requires VIGIL_BACKEND_TOKEN unless VIGIL_BACKEND_AUTH_MODE=disabled)"
        );

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_cancel.cancel();
        });

        runtime.run(event_rx, cancel).await
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
}
