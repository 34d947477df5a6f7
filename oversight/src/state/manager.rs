//! Persistent snapshot of coordinator state for crash recovery and audit.
//!
//! One JSON document per agent instance, written atomically (temp file +
//! rename). The autosave loop is started by `start()` and cancelled by
//! `stop()`; `stop()` always performs a final save.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    PersistedState, StateChange, StateChannel, StateSnapshot, StateStats, STATE_SCHEMA_VERSION,
};
use crate::events::{OpsEvent, SharedEventBus};

/// Bounded length of the change ring.
const HISTORY_CAPACITY: usize = 100;

/// Default autosave interval.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(String),

    #[error("incompatible state schema: found {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

#[derive(Debug, Default)]
struct Inner {
    current: HashMap<StateChannel, serde_json::Value>,
    snapshots: Vec<StateSnapshot>,
    history: VecDeque<StateChange>,
    stats: StateStats,
}

impl Inner {
    fn push_change(&mut self, change: StateChange) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(change);
    }

    fn to_document(&self) -> PersistedState {
        PersistedState {
            schema_version: STATE_SCHEMA_VERSION,
            current_states: self.current.clone(),
            state_snapshots: self.snapshots.clone(),
            state_history: self.history.clone(),
            stats: self.stats.clone(),
            saved_at: Utc::now(),
        }
    }
}

struct Autosave {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Typed-channel state store with snapshots, a bounded change ring, and
/// periodic persistence.
pub struct StateManager {
    path: PathBuf,
    interval: Duration,
    inner: Arc<RwLock<Inner>>,
    events: Option<SharedEventBus>,
    autosave: Mutex<Option<Autosave>>,
}

impl StateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_AUTOSAVE_INTERVAL,
            inner: Arc::new(RwLock::new(Inner::default())),
            events: None,
            autosave: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace a channel's state, recording the change.
    pub fn set_state(
        &self,
        channel: StateChannel,
        value: serde_json::Value,
        reason: impl Into<String>,
    ) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        let old = inner
            .current
            .get(&channel)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let change = StateChange::new(channel, old, value.clone(), reason);
        debug!(%channel, change_id = %change.change_id, "state changed");
        inner.current.insert(channel, value);
        inner.push_change(change);
        inner.stats.sets += 1;
    }

    pub fn get_state(&self, channel: StateChannel) -> Option<serde_json::Value> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .current
            .get(&channel)
            .cloned()
    }

    pub fn all_states(&self) -> HashMap<StateChannel, serde_json::Value> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .current
            .clone()
    }

    pub fn clear_state(&self, channel: StateChannel, reason: impl Into<String>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        if let Some(old) = inner.current.remove(&channel) {
            let change = StateChange::new(channel, old, serde_json::Value::Null, reason);
            inner.push_change(change);
        }
    }

    /// Capture one channel for later restore. Returns the snapshot id.
    pub fn create_snapshot(&self, channel: StateChannel, reason: impl Into<String>) -> String {
        let mut inner = self.inner.write().expect("state lock poisoned");
        let snapshot = StateSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            channel,
            timestamp: Utc::now(),
            state: inner
                .current
                .get(&channel)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            reason: reason.into(),
        };
        let id = snapshot.snapshot_id.clone();
        inner.snapshots.push(snapshot);
        inner.stats.snapshots_taken += 1;
        info!(%channel, snapshot_id = %id, "snapshot created");
        id
    }

    pub fn snapshots(&self, channel: Option<StateChannel>) -> Vec<StateSnapshot> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner
            .snapshots
            .iter()
            .filter(|s| channel.map(|c| s.channel == c).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Re-apply a past snapshot atomically and emit `StateRestored`.
    ///
    /// The coordinator decides whether any in-flight task is still valid
    /// after a restore; this only swaps the channel state.
    pub fn restore_from_snapshot(
        &self,
        snapshot_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), StateError> {
        let reason = reason.into();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let snapshot = inner
                .snapshots
                .iter()
                .find(|s| s.snapshot_id == snapshot_id)
                .cloned()
                .ok_or_else(|| StateError::UnknownSnapshot(snapshot_id.to_string()))?;

            let old = inner
                .current
                .get(&snapshot.channel)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let change = StateChange::new(
                snapshot.channel,
                old,
                snapshot.state.clone(),
                format!("restore from snapshot {snapshot_id}: {reason}"),
            );
            inner.current.insert(snapshot.channel, snapshot.state.clone());
            inner.push_change(change);
            inner.stats.restores += 1;
        }

        info!(snapshot_id, reason, "state restored from snapshot");
        if let Some(events) = &self.events {
            events.publish(OpsEvent::StateRestored {
                snapshot_id: snapshot_id.to_string(),
                reason,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Change history, newest last, bounded by the ring capacity.
    pub fn history(&self, limit: usize) -> Vec<StateChange> {
        let inner = self.inner.read().expect("state lock poisoned");
        inner
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> StateStats {
        self.inner.read().expect("state lock poisoned").stats.clone()
    }

    /// Write the state document: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self) -> Result<(), StateError> {
        let document = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            inner.stats.saves += 1;
            inner.stats.last_saved_at = Some(Utc::now());
            inner.to_document()
        };
        persist(&self.path, &document)?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    /// Load the latest valid document. Returns `false` when no state file
    /// exists yet.
    pub fn load(&self) -> Result<bool, StateError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let document: PersistedState = serde_json::from_str(&contents)?;
        if document.schema_version != STATE_SCHEMA_VERSION {
            return Err(StateError::SchemaMismatch {
                found: document.schema_version,
                expected: STATE_SCHEMA_VERSION,
            });
        }

        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.current = document.current_states;
        inner.snapshots = document.state_snapshots;
        inner.history = document.state_history;
        inner.stats = document.stats;
        info!(path = %self.path.display(), "state loaded");
        Ok(true)
    }

    /// Start the autosave loop. Idempotent: a second call replaces the
    /// previous loop.
    pub fn start(&self) {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let inner = self.inner.clone();
        let path = self.path.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let document = {
                            let mut inner = inner.write().expect("state lock poisoned");
                            inner.stats.saves += 1;
                            inner.stats.last_saved_at = Some(Utc::now());
                            inner.to_document()
                        };
                        if let Err(e) = persist(&path, &document) {
                            warn!(error = %e, "autosave failed");
                        }
                    }
                }
            }
        });

        let mut guard = self.autosave.lock().expect("autosave lock poisoned");
        if let Some(previous) = guard.take() {
            previous.token.cancel();
            previous.handle.abort();
        }
        *guard = Some(Autosave { token, handle });
        info!(interval_secs = self.interval.as_secs(), "autosave started");
    }

    /// Cancel the autosave loop and write a final document.
    pub async fn stop(&self) -> Result<(), StateError> {
        let autosave = self.autosave.lock().expect("autosave lock poisoned").take();
        if let Some(autosave) = autosave {
            autosave.token.cancel();
            let _ = autosave.handle.await;
        }
        self.save()
    }
}

fn persist(path: &Path, document: &PersistedState) -> Result<(), StateError> {
    let json = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
