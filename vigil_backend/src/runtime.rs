use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autonomy::{
    AgentEvent, AutonomyScheduler, AutonomyStatus, ChannelSaveTrigger, Maintenance, SaveTrigger,
    SchedulerTiming,
};
use crate::config::{BackendConfig, PresenceMode};
use crate::database::{DirectiveLoadReport, JournalStore};
use crate::directives::load_manifest;
use crate::importer::{TranscriptImporter, TranscriptWatcher};
use crate::presence::{PresenceDetector, StaticPresence, TmuxPresence};
use crate::server::{self, BackendAuthConfig, ServerState};

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub store: Arc<JournalStore>,
    pub presence: Arc<dyn PresenceDetector>,
    pub directives: DirectiveLoadReport,
    save_trigger: Arc<dyn SaveTrigger>,
}

pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    event_tx: Sender<AgentEvent>,
    presence: Option<Arc<dyn PresenceDetector>>,
    save_trigger: Option<Arc<dyn SaveTrigger>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            presence: None,
            save_trigger: None,
        }
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceDetector>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_save_trigger(mut self, trigger: Arc<dyn SaveTrigger>) -> Self {
        self.save_trigger = Some(trigger);
        self
    }

    /// Open the store and load directives. Any failure here is fatal.
    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let store = JournalStore::open(&config.database_path)
            .with_context(|| format!("Failed to open journal store {}", config.database_path))?;

        let manifest = load_manifest(config.directives_path.as_deref().map(Path::new))?;
        let directives = store
            .load_directives_from(&manifest)
            .context("Failed to load directives")?;
        tracing::info!(
            "Directives loaded: {} parsed, {} new",
            directives.parsed,
            directives.inserted
        );

        let presence = match self.presence {
            Some(presence) => presence,
            None => build_presence(&config),
        };
        let save_trigger: Arc<dyn SaveTrigger> = match self.save_trigger {
            Some(trigger) => trigger,
            None => Arc::new(ChannelSaveTrigger::new(self.event_tx)),
        };

        Ok(BackendRuntime {
            config,
            store: Arc::new(store),
            presence,
            directives,
            save_trigger,
        })
    }
}

fn build_presence(config: &BackendConfig) -> Arc<dyn PresenceDetector> {
    match config.presence.mode {
        PresenceMode::Tmux => {
            tracing::info!(
                "Presence via {} (socket: {})",
                config.presence.tmux_binary,
                config.presence.tmux_socket.as_deref().unwrap_or("default")
            );
            Arc::new(TmuxPresence::from_config(&config.presence))
        }
        PresenceMode::Never => {
            tracing::info!("Presence detection disabled; running unattended");
            Arc::new(StaticPresence(false))
        }
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    pub fn scheduler(&self) -> AutonomyScheduler {
        AutonomyScheduler::new(
            self.store.clone(),
            self.presence.clone(),
            self.save_trigger.clone(),
            SchedulerTiming::from_config(&self.config),
        )
        .with_maintenance(Maintenance::new(
            self.config.context_file.as_ref().map(PathBuf::from),
        ))
    }

    pub fn spawn_scheduler(
        &self,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, watch::Receiver<AutonomyStatus>) {
        let scheduler = self.scheduler();
        let status = scheduler.subscribe();
        (scheduler.spawn(cancel), status)
    }

    /// Transcript watcher for `transcript_dir`, when one is configured.
    pub async fn transcript_watcher(&self) -> Result<Option<TranscriptWatcher>> {
        let Some(dir) = self.config.transcript_dir.clone() else {
            return Ok(None);
        };
        let store = self.store.clone();
        let importer = tokio::task::spawn_blocking(move || TranscriptImporter::new(store))
            .await
            .context("Transcript importer setup panicked")?
            .context("Failed to load known chat message ids")?;
        Ok(Some(TranscriptWatcher::new(
            importer,
            dir,
            self.config.transcript_poll_interval(),
        )))
    }

    /// Run the scheduler, the transcript watcher and (optionally) the API
    /// until `cancel` fires.
    ///
    /// The store is dropped only after the background tasks have returned.
    pub async fn run(self, event_rx: Receiver<AgentEvent>, cancel: CancellationToken) -> Result<()> {
        let auth = if self.config.enable_api {
            Some(BackendAuthConfig::from_env()?)
        } else {
            None
        };
        let watcher = self.transcript_watcher().await?;

        let bridge = spawn_event_bridge(event_rx);
        let (scheduler, status) = self.spawn_scheduler(cancel.clone());
        let watcher = watcher.map(|watcher| watcher.spawn(cancel.clone()));

        let served = if let Some(auth) = auth {
            let state = Arc::new(ServerState {
                store: self.store.clone(),
                status,
                auth,
            });
            server::serve_backend(state, &self.config.bind_addr, cancel.clone()).await
        } else {
            tracing::info!("HTTP API disabled");
            cancel.cancelled().await;
            Ok(())
        };

        if served.is_err() {
            cancel.cancel();
        }
        if let Err(e) = scheduler.await {
            tracing::error!("Autonomy scheduler task failed: {}", e);
        }
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                tracing::error!("Transcript watcher task failed: {}", e);
            }
        }

        drop(self);
        if let Err(e) = bridge.await {
            tracing::error!("Event bridge task failed: {}", e);
        }
        tracing::info!("Backend runtime stopped");
        served
    }
}

/// Drain scheduler events until every sender is gone.
pub fn spawn_event_bridge(event_rx: Receiver<AgentEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                AgentEvent::SaveRequested {
                    reason,
                    mandate,
                    requested_at,
                } => {
                    tracing::info!(
                        "[{}] save requested ({}): {}",
                        requested_at.to_rfc3339(),
                        reason,
                        mandate
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JournalKind;

    fn test_config(dir: &Path) -> BackendConfig {
        BackendConfig {
            database_path: dir.join("nested").join("vigil.db").display().to_string(),
            enable_api: false,
            presence: crate::config::PresenceConfig {
                mode: PresenceMode::Never,
                ..Default::default()
            },
            ..BackendConfig::default()
        }
    }

    #[test]
    fn bootstrap_opens_store_and_loads_directives_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let (tx, _rx) = flume::unbounded();
        let first = BackendRuntime::bootstrap(config.clone(), tx).unwrap();
        assert!(first.directives.parsed > 0);
        assert_eq!(first.directives.inserted, first.directives.parsed);
        assert_eq!(first.store.count(JournalKind::Chat).unwrap(), 1);
        drop(first);

        let (tx, _rx) = flume::unbounded();
        let second = BackendRuntime::bootstrap(config, tx).unwrap();
        assert_eq!(second.directives.inserted, 0);
        assert_eq!(
            second.store.count(JournalKind::Directives).unwrap(),
            second.directives.parsed
        );
        assert_eq!(second.store.count(JournalKind::Chat).unwrap(), 1);
    }

    #[test]
    fn missing_directives_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            directives_path: Some(dir.path().join("absent.txt").display().to_string()),
            ..test_config(dir.path())
        };
        let (tx, _rx) = flume::unbounded();
        assert!(BackendRuntime::bootstrap(config, tx).is_err());
    }

    #[tokio::test]
    async fn run_returns_after_cancel_without_api() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(test_config(dir.path()), tx).unwrap();
        let store = runtime.store.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(rx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap().unwrap();

        // The runtime's handle is gone; ours is the last one.
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn run_syncs_configured_transcript_dir() {
        let dir = tempfile::tempdir().unwrap();
        let chats = dir.path().join("chats");
        std::fs::create_dir_all(&chats).unwrap();
        std::fs::write(
            chats.join("session-1.json"),
            r#"{"sessionId": "s1", "messages": [{"id": "t1", "type": "user", "content": "hi"}]}"#,
        )
        .unwrap();

        let config = BackendConfig {
            transcript_dir: Some(chats.display().to_string()),
            ..test_config(dir.path())
        };
        let (tx, rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(config, tx).unwrap();
        let store = runtime.store.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(rx, cancel.clone()));
        for _ in 0..100 {
            if store.count(JournalKind::Chat).unwrap() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        let chat = store.get_chat_entries(10).unwrap();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].session_id.as_deref(), Some("s1"));
        assert_eq!(Arc::strong_count(&store), 1);
    }
}
