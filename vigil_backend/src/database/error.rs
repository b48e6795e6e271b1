use std::path::PathBuf;

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the journal store.
///
/// Only `Initialization`, `Open` and `Schema` are fatal; they can only happen
/// while the store is being brought up. Writes and reads fail per call and the
/// caller decides whether to log or surface them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare store directory {path:?}: {source}")]
    Initialization {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open database {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema step '{step}' failed: {source}")]
    Schema {
        step: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("insert into '{table}' failed: {source}")]
    Write {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("query on '{table}' failed: {source}")]
    Read {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn schema(step: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Schema {
            step: step.into(),
            source,
        }
    }
}
