//! The polling loop: fetch, detect change, dispatch, persist, sleep.
//!
//! One sequential cycle at a time. Every collaborator failure is absorbed
//! here: fetch errors back off, store errors degrade, delivery errors are
//! logged per destination. Nothing short of a stop signal ends the loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConfigManager, ConfigSource};
use crate::notify::{dispatch_to_all, NotificationSink, QueueRenderer};
use crate::router;
use crate::store::{unix_now, ResilientStore, SharedResilientStore};
use crate::ticket::{Ticket, TicketSource};

/// Where the loop currently is in its cycle, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStage {
    /// Sleeping between cycles.
    Idle,
    /// Fetching tickets and refreshing config.
    Polling,
    /// Sleeping out an error backoff.
    Backoff,
    /// Rendering and delivering notifications.
    Notifying,
    /// Stop signal honored; terminal.
    Stopped,
}

impl std::fmt::Display for LoopStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopStage::Idle => "idle",
            LoopStage::Polling => "polling",
            LoopStage::Backoff => "backoff",
            LoopStage::Notifying => "notifying",
            LoopStage::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Order-independent digest of an open-ticket id set.
///
/// Ids are filtered to positive values, deduplicated, sorted and JSON
/// encoded before hashing, so `[3,1,2]` and `[1,2,3]` are the same
/// snapshot. Returns the hex digest and the canonical id list.
pub fn snapshot_hash(tickets: &[Ticket]) -> (String, Vec<i64>) {
    let mut ids: Vec<i64> = tickets.iter().map(|t| t.id).filter(|id| *id > 0).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut payload = String::from("[");
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            payload.push(',');
        }
        payload.push_str(&id.to_string());
    }
    payload.push(']');
    let digest = format!("{:x}", Sha256::digest(payload.as_bytes()));
    (digest, ids)
}

/// Scheduling knobs for the loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Seconds between polls when the source is healthy.
    pub base_interval_s: f64,
    /// Ceiling for the error backoff.
    pub max_backoff_s: f64,
    /// Minimum spacing between two main-queue notifications.
    pub min_notify_interval_s: f64,
    /// Ticket fetch cap per cycle.
    pub fetch_limit: usize,
    /// Store key for the persisted loop state.
    pub state_key: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            base_interval_s: 30.0,
            max_backoff_s: 300.0,
            min_notify_interval_s: 60.0,
            fetch_limit: 200,
            state_key: "polling_state".to_string(),
        }
    }
}

/// Mutable loop state. Written only by the loop itself; diagnostics read
/// snapshots of it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollingState {
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_run_at: Option<f64>,
    pub last_success_at: Option<f64>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    /// Interval the next sleep will use; grows under backoff.
    pub current_interval_s: f64,
    pub last_sent_snapshot: Option<String>,
    pub last_sent_ids: Option<Vec<i64>>,
    pub last_sent_count: Option<usize>,
    pub last_sent_at: Option<f64>,
    pub last_notify_attempt_at: Option<f64>,
    pub notify_skipped_rate_limit: u64,
    pub last_calculated_count: Option<usize>,
    pub last_calculated_at: Option<f64>,
    pub cycles_without_destination: u64,
    pub last_without_destination_at: Option<f64>,
}

/// The subset of [`PollingState`] that survives restarts. Everything else
/// is diagnostics and starts fresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedPollingState {
    #[serde(default)]
    pub last_sent_snapshot: Option<String>,
    #[serde(default)]
    pub last_sent_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub last_sent_count: Option<usize>,
    #[serde(default)]
    pub last_sent_at: Option<f64>,
    #[serde(default)]
    pub last_notify_attempt_at: Option<f64>,
    #[serde(default)]
    pub notify_skipped_rate_limit: u64,
}

impl PollingState {
    fn load_persisted(&mut self, store: &ResilientStore, key: &str) {
        let persisted = match store.get_typed::<PersistedPollingState>(key) {
            Some(persisted) => persisted,
            None => return,
        };
        self.last_sent_snapshot = persisted.last_sent_snapshot;
        self.last_sent_ids = persisted.last_sent_ids;
        self.last_sent_count = persisted.last_sent_count;
        self.last_sent_at = persisted.last_sent_at;
        self.last_notify_attempt_at = persisted.last_notify_attempt_at;
        self.notify_skipped_rate_limit = persisted.notify_skipped_rate_limit;
    }

    fn save_persisted(&self, store: &ResilientStore, key: &str) {
        store.set_typed(
            key,
            &PersistedPollingState {
                last_sent_snapshot: self.last_sent_snapshot.clone(),
                last_sent_ids: self.last_sent_ids.clone(),
                last_sent_count: self.last_sent_count,
                last_sent_at: self.last_sent_at,
                last_notify_attempt_at: self.last_notify_attempt_at,
                notify_skipped_rate_limit: self.notify_skipped_rate_limit,
            },
        );
    }
}

/// The main polling loop.
///
/// Owns every collaborator and all mutable state. `run` drives cycles until
/// the stop signal; `cycle` is public so tests and one-shot mode can step
/// the loop with explicit timestamps.
pub struct PollLoop {
    source: Arc<dyn TicketSource>,
    sink: Arc<dyn NotificationSink>,
    config_source: Arc<dyn ConfigSource>,
    renderer: Arc<dyn QueueRenderer>,
    store: SharedResilientStore,
    config: ConfigManager,
    settings: PollSettings,
    state: PollingState,
    stage: LoopStage,
    stop_rx: watch::Receiver<bool>,
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn TicketSource>,
        sink: Arc<dyn NotificationSink>,
        config_source: Arc<dyn ConfigSource>,
        renderer: Arc<dyn QueueRenderer>,
        store: SharedResilientStore,
        config: ConfigManager,
        settings: PollSettings,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut state = PollingState {
            current_interval_s: settings.base_interval_s,
            ..PollingState::default()
        };
        state.load_persisted(&store, &settings.state_key);
        if state.last_sent_snapshot.is_some() {
            info!(
                last_sent_count = state.last_sent_count,
                "restored polling state, duplicate notification suppressed"
            );
        }
        Self {
            source,
            sink,
            config_source,
            renderer,
            store,
            config,
            settings,
            state,
            stage: LoopStage::Idle,
            stop_rx,
        }
    }

    pub fn state(&self) -> &PollingState {
        &self.state
    }

    pub fn stage(&self) -> LoopStage {
        self.stage
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn store(&self) -> &ResilientStore {
        &self.store
    }

    /// Run cycles until the stop signal flips. The signal is honored at the
    /// sleep boundary; an in-flight cycle always finishes first.
    pub async fn run(&mut self) {
        info!(
            interval_s = self.settings.base_interval_s,
            min_notify_interval_s = self.settings.min_notify_interval_s,
            "poll loop started"
        );
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            self.cycle(unix_now()).await;
            self.stage = LoopStage::Idle;
            let sleep_s = self.state.current_interval_s.max(0.0);
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    // A dropped sender means the host is going away too.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs_f64(sleep_s)) => {}
            }
        }
        self.stage = LoopStage::Stopped;
        info!("poll loop stopped");
    }

    /// One poll cycle at time `now` (Unix seconds, injected for tests).
    pub async fn cycle(&mut self, now: f64) {
        let started = std::time::Instant::now();
        self.cycle_inner(now).await;
        self.state.last_duration_ms = Some(started.elapsed().as_millis() as u64);
    }

    async fn cycle_inner(&mut self, now: f64) {
        self.stage = LoopStage::Polling;
        self.state.runs += 1;
        self.state.last_run_at = Some(now);

        // Surfaces store recovery promptly instead of on the next write.
        self.store.probe();

        self.config.refresh(self.config_source.as_ref(), false).await;

        let tickets = match self.source.fetch(self.settings.fetch_limit).await {
            Ok(tickets) => tickets,
            Err(e) => {
                self.record_fetch_failure(e.to_string());
                return;
            }
        };
        self.state.last_success_at = Some(now);
        self.state.last_error = None;
        self.state.consecutive_failures = 0;
        self.state.current_interval_s = self.settings.base_interval_s;

        // Escalations are due the moment a threshold is crossed; they skip
        // the main-queue rate limit entirely.
        let batches = self.config.escalations(&tickets, now);
        if !batches.is_empty() {
            self.stage = LoopStage::Notifying;
            for batch in &batches {
                let text = self.renderer.render_escalation(&batch.tickets, &batch.mention);
                dispatch_to_all(self.sink.as_ref(), &[batch.dest], &text).await;
            }
            self.stage = LoopStage::Polling;
        }

        let (snapshot, ids) = snapshot_hash(&tickets);
        self.state.last_calculated_count = Some(ids.len());
        self.state.last_calculated_at = Some(now);

        if self.state.last_sent_snapshot.as_deref() == Some(snapshot.as_str()) {
            debug!(count = ids.len(), "queue unchanged");
            return;
        }

        if let Some(last_attempt) = self.state.last_notify_attempt_at {
            let elapsed = now - last_attempt;
            if elapsed < self.settings.min_notify_interval_s {
                // Not persisted: the change is still pending and must be
                // retried next cycle, restart or not.
                self.state.notify_skipped_rate_limit += 1;
                debug!(
                    elapsed_s = elapsed,
                    skipped = self.state.notify_skipped_rate_limit,
                    "queue changed inside rate-limit window, deferred"
                );
                return;
            }
        }

        self.stage = LoopStage::Notifying;
        let active = self.config.active();
        let destinations = router::pick_destinations(
            &tickets,
            &active.routing_rules,
            active.default_dest,
            &active.routing_fields,
        );
        if destinations.is_empty() {
            self.state.cycles_without_destination += 1;
            self.state.last_without_destination_at = Some(now);
            warn!(
                count = ids.len(),
                "queue changed but no destination is configured"
            );
        } else {
            let text = self.renderer.render_queue(&tickets);
            let delivered = dispatch_to_all(self.sink.as_ref(), &destinations, &text).await;
            info!(
                count = ids.len(),
                destinations = destinations.len(),
                delivered,
                "queue notification sent"
            );
        }

        self.state.last_notify_attempt_at = Some(now);
        self.state.last_sent_snapshot = Some(snapshot);
        self.state.last_sent_count = Some(ids.len());
        self.state.last_sent_ids = Some(ids);
        self.state.last_sent_at = Some(now);
        self.state.save_persisted(&self.store, &self.settings.state_key);
    }

    fn record_fetch_failure(&mut self, error: String) {
        self.stage = LoopStage::Backoff;
        self.state.failures += 1;
        self.state.consecutive_failures += 1;
        let doubled = self.state.current_interval_s * 2.0;
        self.state.current_interval_s = f64::min(
            self.settings.max_backoff_s,
            f64::max(self.settings.base_interval_s, doubled),
        );
        warn!(
            error = %error,
            consecutive = self.state.consecutive_failures,
            next_interval_s = self.state.current_interval_s,
            "ticket fetch failed, backing off"
        );
        self.state.last_error = Some(error);
    }
}
