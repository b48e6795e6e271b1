use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// The append-only tables the store exposes for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Chat,
    Versions,
    UserContext,
    SelfJournal,
    Evolution,
    Philosophy,
    Technology,
    Misc,
    Directives,
}

impl JournalKind {
    pub const ALL: [JournalKind; 9] = [
        JournalKind::Chat,
        JournalKind::Versions,
        JournalKind::UserContext,
        JournalKind::SelfJournal,
        JournalKind::Evolution,
        JournalKind::Philosophy,
        JournalKind::Technology,
        JournalKind::Misc,
        JournalKind::Directives,
    ];

    /// On-disk table name. These match databases written by earlier deployments.
    pub fn table(self) -> &'static str {
        match self {
            JournalKind::Chat => "ch",
            JournalKind::Versions => "vs",
            JournalKind::UserContext => "user_context",
            JournalKind::SelfJournal => "sovereign",
            JournalKind::Evolution => "evolution",
            JournalKind::Philosophy => "philosophy",
            JournalKind::Technology => "technologies",
            JournalKind::Misc => "jon",
            JournalKind::Directives => "prime_directives",
        }
    }

    pub fn as_slug(self) -> &'static str {
        match self {
            JournalKind::Chat => "chat",
            JournalKind::Versions => "versions",
            JournalKind::UserContext => "user_context",
            JournalKind::SelfJournal => "self_journal",
            JournalKind::Evolution => "evolution",
            JournalKind::Philosophy => "philosophy",
            JournalKind::Technology => "technology",
            JournalKind::Misc => "misc",
            JournalKind::Directives => "directives",
        }
    }

    pub fn from_slug(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        JournalKind::ALL
            .into_iter()
            .find(|kind| kind.as_slug() == normalized || kind.table() == normalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub kind: String,
    pub content: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub version: String,
    pub changelog: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContextEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub key: String,
    pub value: String,
    pub context: String,
}

/// A note written by the daemon itself while running unattended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub focus_area: String,
    pub kind: String,
    pub content: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub milestone: String,
    pub description: String,
    pub growth_index: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhilosophyEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub insight: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnologyEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub key: String,
    pub value: String,
    pub success_rate: f64,
}

/// Free-form operator notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiscEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub key: String,
    pub value: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub directive: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub version: i64,
    pub applied_at: DateTime<Utc>,
}

/// Parse a timestamp column.
///
/// Rows written through the store carry SQLite's `CURRENT_TIMESTAMP` form;
/// rows imported by older tooling may carry RFC 3339.
pub(crate) fn parse_db_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Timestamp of one row. Legacy rows may hold NULL or free text here; those
/// read as the Unix epoch so one bad row never fails the whole page.
pub(crate) fn row_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw = row.get::<_, Option<String>>(column)?;
    match raw.as_deref().and_then(parse_db_timestamp) {
        Some(timestamp) => Ok(timestamp),
        None => {
            tracing::debug!("Unreadable timestamp {:?}; reading it as the epoch", raw);
            Ok(DateTime::<Utc>::default())
        }
    }
}
