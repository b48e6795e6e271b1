//! Presence-aware autonomy scheduler.
//!
//! One background task samples operator presence on a fixed tick, flips
//! between attended and unattended mode, and fires save checkpoints on mode
//! edges and on a periodic timer while unattended.

mod machine;
mod maintenance;
mod save_trigger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::database::JournalStore;
use crate::presence::PresenceDetector;

pub use machine::{AutonomyMachine, AutonomyMode, SchedulerTiming, TickOutcome};
pub use maintenance::{Maintenance, MaintenanceReport, DEFAULT_SYSTEM_CONTEXT};
pub use save_trigger::{save_mandate, ChannelSaveTrigger, SaveReason, SaveRecord, SaveTrigger};

pub const CHECKPOINT_FOCUS_AREA: &str = "autonomy";
pub const CHECKPOINT_ENTRY_KIND: &str = "save_checkpoint";

#[derive(Debug, Clone)]
pub enum AgentEvent {
    SaveRequested {
        reason: SaveReason,
        mandate: String,
        requested_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutonomyStatus {
    pub running: bool,
    /// `None` until the first presence sample completes.
    pub mode: Option<AutonomyMode>,
    pub mode_since: Option<DateTime<Utc>>,
    pub last_save: Option<SaveRecord>,
    pub ticks: u64,
    pub saves: u64,
    pub poll_interval_secs: u64,
    pub attended_poll_interval_secs: u64,
    pub save_interval_secs: u64,
}

pub struct AutonomyScheduler {
    store: Arc<JournalStore>,
    presence: Arc<dyn PresenceDetector>,
    trigger: Arc<dyn SaveTrigger>,
    maintenance: Maintenance,
    timing: SchedulerTiming,
    status_tx: watch::Sender<AutonomyStatus>,
}

impl AutonomyScheduler {
    pub fn new(
        store: Arc<JournalStore>,
        presence: Arc<dyn PresenceDetector>,
        trigger: Arc<dyn SaveTrigger>,
        timing: SchedulerTiming,
    ) -> Self {
        let (status_tx, _) = watch::channel(AutonomyStatus {
            poll_interval_secs: timing.poll_interval.as_secs(),
            attended_poll_interval_secs: timing.attended_poll_interval.as_secs(),
            save_interval_secs: timing.save_interval.as_secs(),
            ..AutonomyStatus::default()
        });
        Self {
            store,
            presence,
            trigger,
            maintenance: Maintenance::default(),
            timing,
            status_tx,
        }
    }

    pub fn with_maintenance(mut self, maintenance: Maintenance) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<AutonomyStatus> {
        self.status_tx.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Autonomy scheduler starting (poll {:?}, attended poll {:?}, save interval {:?})",
            self.timing.poll_interval,
            self.timing.attended_poll_interval,
            self.timing.save_interval
        );

        let Some(initially_attended) = self.sample_presence(&cancel).await else {
            self.finish();
            return;
        };
        let mut machine = AutonomyMachine::new(initially_attended, Instant::now(), self.timing);
        self.status_tx.send_modify(|status| {
            status.running = true;
            status.mode = Some(machine.mode());
            status.mode_since = Some(Utc::now());
        });
        tracing::info!("Initial autonomy mode: {:?}", machine.mode());

        let mut wait = machine.initial_wait();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }

            let Some(attended) = self.sample_presence(&cancel).await else {
                break;
            };
            let previous = machine.mode();
            let outcome = machine.observe(attended, Instant::now());

            if previous != machine.mode() {
                tracing::info!("Autonomy mode {:?} -> {:?}", previous, machine.mode());
            }
            if let Some(reason) = outcome.save {
                self.checkpoint(reason).await;
            }
            if outcome.run_maintenance {
                self.maintenance.run(&self.store).await;
            }

            let mode = machine.mode();
            self.status_tx.send_modify(|status| {
                status.ticks += 1;
                if status.mode != Some(mode) {
                    status.mode = Some(mode);
                    status.mode_since = Some(Utc::now());
                }
            });
            wait = outcome.next_wait;
        }

        self.finish();
    }

    async fn sample_presence(&self, cancel: &CancellationToken) -> Option<bool> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            attended = self.presence.is_operator_attached() => Some(attended),
        }
    }

    /// The journal write is awaited outside the cancellation select, so a
    /// shutdown never abandons it halfway.
    async fn checkpoint(&self, reason: SaveReason) {
        tracing::info!("Save checkpoint: {}", reason);
        self.trigger.trigger_save(reason);

        let metadata = serde_json::json!({ "reason": reason.label() }).to_string();
        let content = save_mandate(reason);
        let written = self
            .store
            .blocking(move |store| {
                store.insert_journal_entry(
                    CHECKPOINT_FOCUS_AREA,
                    CHECKPOINT_ENTRY_KIND,
                    &content,
                    Some(&metadata),
                )
            })
            .await;
        if let Err(e) = written {
            tracing::warn!("Failed to journal '{}' checkpoint: {}", reason, e);
        }

        let record = SaveRecord {
            reason,
            at: Utc::now(),
        };
        self.status_tx.send_modify(|status| {
            status.saves += 1;
            status.last_save = Some(record);
        });
    }

    fn finish(&self) {
        self.status_tx.send_modify(|status| status.running = false);
        tracing::info!("Autonomy scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays presence samples in order, repeating the last one forever.
    struct ScriptedPresence {
        samples: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
    }

    impl ScriptedPresence {
        fn new(samples: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples.iter().copied().collect()),
                last: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl PresenceDetector for ScriptedPresence {
        async fn is_operator_attached(&self) -> bool {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.samples.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }
    }

    #[derive(Default)]
    struct RecordingTrigger {
        reasons: Mutex<Vec<SaveReason>>,
    }

    impl RecordingTrigger {
        fn reasons(&self) -> Vec<SaveReason> {
            self.reasons.lock().unwrap().clone()
        }
    }

    impl SaveTrigger for RecordingTrigger {
        fn trigger_save(&self, reason: SaveReason) {
            self.reasons.lock().unwrap().push(reason);
        }
    }

    fn timing(save_interval_secs: u64) -> SchedulerTiming {
        SchedulerTiming {
            poll_interval: Duration::from_secs(5),
            attended_poll_interval: Duration::from_secs(10),
            save_interval: Duration::from_secs(save_interval_secs),
        }
    }

    fn scheduler(
        samples: &[bool],
        save_interval_secs: u64,
    ) -> (AutonomyScheduler, Arc<RecordingTrigger>, Arc<JournalStore>) {
        let store = Arc::new(JournalStore::open_in_memory().unwrap());
        let trigger = Arc::new(RecordingTrigger::default());
        let scheduler = AutonomyScheduler::new(
            store.clone(),
            ScriptedPresence::new(samples),
            trigger.clone(),
            timing(save_interval_secs),
        );
        (scheduler, trigger, store)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_detach_fire_once_each() {
        let (scheduler, trigger, store) = scheduler(&[false, false, true, true, false], 1200);
        let status = scheduler.subscribe();
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        // Samples at t=0 (initial), 5, 10, 20, 30 and every 5s after.
        sleep(Duration::from_secs(47)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            trigger.reasons(),
            vec![SaveReason::UserConnected, SaveReason::UserDetached]
        );

        let journal = store.get_journal_entries(10).unwrap();
        assert_eq!(journal.len(), 2);
        assert!(journal
            .iter()
            .all(|entry| entry.focus_area == CHECKPOINT_FOCUS_AREA
                && entry.kind == CHECKPOINT_ENTRY_KIND));
        assert!(journal[0].content.contains("User Detached"));

        let status = status.borrow().clone();
        assert!(!status.running);
        assert_eq!(status.mode, Some(AutonomyMode::Unattended));
        assert_eq!(status.saves, 2);
        assert_eq!(
            status.last_save.map(|save| save.reason),
            Some(SaveReason::UserDetached)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_save_fires_once_per_interval() {
        let (scheduler, trigger, _store) = scheduler(&[false], 60);
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        // Ticks every 5s; the interval is first exceeded at 65s, then 130s, 195s.
        sleep(Duration::from_secs(198)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(trigger.reasons(), vec![SaveReason::Periodic; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn attended_start_polls_slowly_without_saving() {
        let (scheduler, trigger, _store) = scheduler(&[true], 60);
        let status = scheduler.subscribe();
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        sleep(Duration::from_secs(305)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(trigger.reasons().is_empty());
        let status = status.borrow().clone();
        assert_eq!(status.mode, Some(AutonomyMode::Attended));
        assert_eq!(status.ticks, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_within_one_tick() {
        let (scheduler, trigger, _store) = scheduler(&[false, true, false], 1200);
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        sleep(Duration::from_secs(7)).await;
        assert_eq!(trigger.reasons(), vec![SaveReason::UserConnected]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop within one poll interval")
            .unwrap();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(trigger.reasons(), vec![SaveReason::UserConnected]);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_samples() {
        let (scheduler, trigger, _store) = scheduler(&[true], 60);
        let status = scheduler.subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        scheduler.run(cancel).await;

        assert!(trigger.reasons().is_empty());
        assert_eq!(status.borrow().mode, None);
        assert!(!status.borrow().running);
    }
}
