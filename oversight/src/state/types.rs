//! Persistent-state record types.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current persisted-document schema. Bump on breaking changes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Typed state channels; each holds one JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChannel {
    Agent,
    Task,
    Execution,
    Connection,
    Error,
    Config,
}

impl std::fmt::Display for StateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Task => write!(f, "task"),
            Self::Execution => write!(f, "execution"),
            Self::Connection => write!(f, "connection"),
            Self::Error => write!(f, "error"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// One recorded mutation of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub change_id: String,
    pub channel: StateChannel,
    pub timestamp: DateTime<Utc>,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
    pub reason: String,
}

impl StateChange {
    pub fn new(
        channel: StateChannel,
        old: serde_json::Value,
        new: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            channel,
            timestamp: Utc::now(),
            old,
            new,
            reason: reason.into(),
        }
    }
}

/// A point-in-time copy of one channel, restorable later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub snapshot_id: String,
    pub channel: StateChannel,
    pub timestamp: DateTime<Utc>,
    pub state: serde_json::Value,
    pub reason: String,
}

/// Counters kept alongside the state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStats {
    pub sets: u64,
    pub snapshots_taken: u64,
    pub restores: u64,
    pub saves: u64,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// The single JSON document persisted per agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub current_states: HashMap<StateChannel, serde_json::Value>,
    pub state_snapshots: Vec<StateSnapshot>,
    pub state_history: VecDeque<StateChange>,
    pub stats: StateStats,
    pub saved_at: DateTime<Utc>,
}
