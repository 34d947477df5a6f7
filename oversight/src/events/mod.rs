//! Event publication: typed events over a broadcast bus.

mod bus;
mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::OpsEvent;
