//! Crash-recovery state: typed channels, snapshots, bounded history,
//! periodic JSON persistence.

mod manager;
mod types;

pub use manager::{StateError, StateManager, DEFAULT_AUTOSAVE_INTERVAL};
pub use types::{
    PersistedState, StateChange, StateChannel, StateSnapshot, StateStats, STATE_SCHEMA_VERSION,
};
