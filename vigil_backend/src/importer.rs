//! Import of exported chat-session transcripts into the chat journal.
//!
//! [`TranscriptImporter`] maps one session document onto chat rows.
//! [`TranscriptWatcher`] keeps a chat directory in sync by re-importing the
//! newest `session-*.json` whenever it changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::database::{JournalStore, StoreResult};

/// Phrases that mark an operator message as a likely personal fact or preference.
const INSIGHT_KEYWORDS: &[&str] = &[
    "i am",
    "i like",
    "i want",
    "my system",
    "remember",
    "i'm",
    "preference",
];
const INSIGHT_MAX_CHARS: usize = 2000;
const INSIGHT_CATEGORY: &str = "heuristic_capture";
const INSIGHT_KEY: &str = "potential_insight";
const INSIGHT_CONTEXT: &str = "Auto-captured from stream";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTranscript {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TranscriptMessage {
    fn entry_kind(&self) -> &'static str {
        match self.kind.as_deref() {
            Some("user") => "input",
            Some("model") => "output",
            _ => "system_event",
        }
    }

    fn is_operator(&self) -> bool {
        self.kind.as_deref() == Some("user")
    }

    /// Message text, or the serialized tool calls when the text is empty.
    fn body(&self) -> String {
        let text = match &self.content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        if !text.is_empty() {
            return text;
        }
        self.tool_calls
            .clone()
            .unwrap_or_else(|| Value::Array(Vec::new()))
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub insights: usize,
    pub failed: usize,
}

pub struct TranscriptImporter {
    store: Arc<JournalStore>,
    known_ids: HashSet<String>,
}

impl TranscriptImporter {
    pub fn new(store: Arc<JournalStore>) -> StoreResult<Self> {
        let known_ids = store.chat_message_ids()?;
        tracing::debug!("Importer knows {} message ids", known_ids.len());
        Ok(Self { store, known_ids })
    }

    pub fn import_file(&mut self, path: &Path) -> Result<ImportReport> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read transcript {:?}", path))?;
        let report = self
            .import_str(&raw)
            .with_context(|| format!("Failed to import transcript {:?}", path))?;
        tracing::info!(
            "Imported {:?}: {} new, {} skipped, {} insights, {} failed",
            path,
            report.imported,
            report.skipped,
            report.insights,
            report.failed
        );
        Ok(report)
    }

    pub fn import_str(&mut self, raw: &str) -> Result<ImportReport> {
        let transcript: SessionTranscript =
            serde_json::from_str(raw).context("Transcript is not a chat-session document")?;
        Ok(self.import(&transcript))
    }

    pub fn import(&mut self, transcript: &SessionTranscript) -> ImportReport {
        let mut report = ImportReport::default();

        for message in &transcript.messages {
            let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) else {
                report.skipped += 1;
                continue;
            };
            if self.known_ids.contains(id) {
                report.skipped += 1;
                continue;
            }

            let body = message.body();
            let metadata = serde_json::json!({
                "id": id,
                "source_timestamp": message.timestamp,
            })
            .to_string();

            if let Err(e) = self.store.insert_chat_entry(
                transcript.session_id.as_deref(),
                message.entry_kind(),
                &body,
                Some(&metadata),
            ) {
                tracing::warn!("Skipping message {}: {}", id, e);
                report.failed += 1;
                continue;
            }
            self.known_ids.insert(id.to_string());
            report.imported += 1;

            if message.is_operator() && self.capture_insight(&body) {
                report.insights += 1;
            }
        }

        report
    }

    fn capture_insight(&self, content: &str) -> bool {
        if !looks_like_insight(content) {
            return false;
        }
        match self.store.misc_value_exists(content) {
            Ok(true) => false,
            Ok(false) => match self.store.insert_misc_entry(
                INSIGHT_CATEGORY,
                INSIGHT_KEY,
                content,
                INSIGHT_CONTEXT,
            ) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Failed to record operator insight: {}", e);
                    false
                }
            },
            Err(e) => {
                tracing::warn!("Failed to check operator insight: {}", e);
                false
            }
        }
    }
}

const SESSION_FILE_PREFIX: &str = "session-";
const SESSION_FILE_SUFFIX: &str = ".json";

/// Most recently modified `session-*.json` in `dir`.
pub fn latest_session_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(SESSION_FILE_PREFIX) || !name.ends_with(SESSION_FILE_SUFFIX) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        if latest.as_ref().map_or(true, |(newest, _)| modified > *newest) {
            latest = Some((modified, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: PathBuf) -> std::io::Result<Self> {
        let meta = std::fs::metadata(&path)?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
            path,
        })
    }
}

/// Polls a chat directory and imports the newest session file whenever it
/// is replaced or rewritten. Known message ids carry over between passes.
pub struct TranscriptWatcher {
    importer: TranscriptImporter,
    dir: PathBuf,
    interval: Duration,
    synced: Option<FileStamp>,
}

impl TranscriptWatcher {
    pub fn new(importer: TranscriptImporter, dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            importer,
            dir: dir.into(),
            interval,
            synced: None,
        }
    }

    /// One sync pass. Returns `None` when there was nothing new to read.
    ///
    /// A file that fails to import is retried on the next pass.
    pub fn poll_once(&mut self) -> Result<Option<ImportReport>> {
        let Some(path) = latest_session_file(&self.dir)
            .with_context(|| format!("Failed to list transcripts in {:?}", self.dir))?
        else {
            return Ok(None);
        };
        let stamp = match FileStamp::of(path) {
            Ok(stamp) => stamp,
            // Rotated away between listing and stat.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.synced.as_ref() == Some(&stamp) {
            return Ok(None);
        }

        let report = self.importer.import_file(&stamp.path)?;
        self.synced = Some(stamp);
        Ok(Some(report))
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Sync immediately, then once per interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Watching {:?} for chat transcripts every {:?}",
            self.dir,
            self.interval
        );
        let interval = self.interval;
        let mut watcher = self;
        loop {
            let pass = tokio::task::spawn_blocking(move || {
                let outcome = watcher.poll_once();
                (watcher, outcome)
            })
            .await;
            watcher = match pass {
                Ok((watcher, Ok(_))) => watcher,
                Ok((watcher, Err(e))) => {
                    tracing::warn!("Transcript sync failed: {:#}", e);
                    watcher
                }
                Err(e) => {
                    tracing::error!("Transcript sync task failed: {}", e);
                    return;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        tracing::info!("Transcript watcher stopped");
    }
}

fn looks_like_insight(content: &str) -> bool {
    if content.is_empty() || content.chars().count() >= INSIGHT_MAX_CHARS {
        return false;
    }
    let lowered = content.to_lowercase();
    INSIGHT_KEYWORDS
        .iter()
        .any(|phrase| lowered.contains(phrase))
}
