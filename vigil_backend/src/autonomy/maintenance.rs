use std::path::PathBuf;
use std::sync::Arc;

use crate::database::{JournalKind, JournalStore};

pub const DEFAULT_SYSTEM_CONTEXT: &str =
    "System context: All systems nominal. Awaiting directives.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub context: String,
    pub store_ok: bool,
    pub journal_rows: usize,
}

/// Diagnostic pass run on every unattended tick.
#[derive(Debug, Clone, Default)]
pub struct Maintenance {
    context_file: Option<PathBuf>,
}

impl Maintenance {
    pub fn new(context_file: Option<PathBuf>) -> Self {
        Self { context_file }
    }

    /// Host description from the context file, or the stock line when the
    /// file is unset, unreadable, or blank.
    pub async fn system_context(&self) -> String {
        let Some(path) = &self.context_file else {
            return DEFAULT_SYSTEM_CONTEXT.to_string();
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
            Ok(_) => DEFAULT_SYSTEM_CONTEXT.to_string(),
            Err(e) => {
                tracing::debug!("Context file {:?} unavailable: {}", path, e);
                DEFAULT_SYSTEM_CONTEXT.to_string()
            }
        }
    }

    pub async fn run(&self, store: &Arc<JournalStore>) -> MaintenanceReport {
        let context = self.system_context().await;

        let checked = store
            .blocking(|store| {
                store.ping()?;
                store.count(JournalKind::SelfJournal)
            })
            .await;
        let (store_ok, journal_rows) = match checked {
            Ok(rows) => (true, rows),
            Err(e) => {
                tracing::warn!("Self-maintenance: store check failed: {}", e);
                (false, 0)
            }
        };

        tracing::debug!(
            "Self-maintenance pass: store_ok={} journal_rows={} context={:?}",
            store_ok,
            journal_rows,
            context
        );

        MaintenanceReport {
            context,
            store_ok,
            journal_rows,
        }
    }
}
