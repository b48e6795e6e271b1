use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::save_trigger::SaveReason;
use crate::config::BackendConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// An operator is attached; the agent only observes.
    Attended,
    /// Nobody is watching; self-maintenance and periodic checkpoints run.
    Unattended,
}

impl AutonomyMode {
    pub fn from_presence(attended: bool) -> Self {
        if attended {
            AutonomyMode::Attended
        } else {
            AutonomyMode::Unattended
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    pub poll_interval: Duration,
    /// Wait used while an operator is attached.
    pub attended_poll_interval: Duration,
    pub save_interval: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            attended_poll_interval: Duration::from_secs(10),
            save_interval: Duration::from_secs(20 * 60),
        }
    }
}

impl SchedulerTiming {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            attended_poll_interval: config.attended_poll_interval(),
            save_interval: config.save_interval(),
        }
    }
}

/// What the loop must do after one presence sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub save: Option<SaveReason>,
    pub run_maintenance: bool,
    pub next_wait: Duration,
}

/// Attended/unattended transitions and the periodic checkpoint timer, with
/// time passed in so every edge can be driven without a runtime.
#[derive(Debug, Clone)]
pub struct AutonomyMachine {
    mode: AutonomyMode,
    last_save: Instant,
    timing: SchedulerTiming,
}

impl AutonomyMachine {
    pub fn new(initially_attended: bool, now: Instant, timing: SchedulerTiming) -> Self {
        Self {
            mode: AutonomyMode::from_presence(initially_attended),
            last_save: now,
            timing,
        }
    }

    pub fn mode(&self) -> AutonomyMode {
        self.mode
    }

    pub fn last_save(&self) -> Instant {
        self.last_save
    }

    /// Wait before the first sample after startup.
    pub fn initial_wait(&self) -> Duration {
        self.wait_for(self.mode)
    }

    fn wait_for(&self, mode: AutonomyMode) -> Duration {
        match mode {
            AutonomyMode::Attended => self.timing.attended_poll_interval,
            AutonomyMode::Unattended => self.timing.poll_interval,
        }
    }

    pub fn observe(&mut self, attended: bool, now: Instant) -> TickOutcome {
        let next = AutonomyMode::from_presence(attended);
        let (save, run_maintenance) = match (self.mode, next) {
            (AutonomyMode::Unattended, AutonomyMode::Attended) => {
                (Some(SaveReason::UserConnected), false)
            }
            (AutonomyMode::Attended, AutonomyMode::Attended) => (None, false),
            (AutonomyMode::Attended, AutonomyMode::Unattended) => {
                (Some(SaveReason::UserDetached), false)
            }
            (AutonomyMode::Unattended, AutonomyMode::Unattended) => {
                let due = now.saturating_duration_since(self.last_save) > self.timing.save_interval;
                (due.then_some(SaveReason::Periodic), true)
            }
        };

        // Edge saves reset the periodic timer as well.
        if save.is_some() {
            self.last_save = now;
        }
        self.mode = next;

        TickOutcome {
            save,
            run_maintenance,
            next_wait: self.wait_for(next),
        }
    }
}
