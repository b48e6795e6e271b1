use std::fmt;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};

use super::AgentEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveReason {
    #[serde(rename = "User Connected")]
    UserConnected,
    #[serde(rename = "User Detached")]
    UserDetached,
    #[serde(rename = "Periodic")]
    Periodic,
}

impl SaveReason {
    pub fn label(self) -> &'static str {
        match self {
            SaveReason::UserConnected => "User Connected",
            SaveReason::UserDetached => "User Detached",
            SaveReason::Periodic => "Periodic",
        }
    }
}

impl fmt::Display for SaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Instruction handed to whatever appends checkpoint summaries to memory.
pub fn save_mandate(reason: SaveReason) -> String {
    format!(
        "Autonomous save mandate ({}): summarize recent activity and append it to long-term memory.",
        reason
    )
}

/// One-shot checkpoint request. Must not block; delivery is not acknowledged.
pub trait SaveTrigger: Send + Sync {
    fn trigger_save(&self, reason: SaveReason);
}

/// Forwards save requests to the runtime event bridge.
#[derive(Clone)]
pub struct ChannelSaveTrigger {
    event_tx: Sender<AgentEvent>,
}

impl ChannelSaveTrigger {
    pub fn new(event_tx: Sender<AgentEvent>) -> Self {
        Self { event_tx }
    }
}

impl SaveTrigger for ChannelSaveTrigger {
    fn trigger_save(&self, reason: SaveReason) {
        let event = AgentEvent::SaveRequested {
            reason,
            mandate: save_mandate(reason),
            requested_at: Utc::now(),
        };
        if self.event_tx.try_send(event).is_err() {
            tracing::warn!("Save request '{}' dropped: event bridge unavailable", reason);
        }
    }
}

/// Last checkpoint, as reported in the scheduler status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRecord {
    pub reason: SaveReason,
    pub at: DateTime<Utc>,
}
