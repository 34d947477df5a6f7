//! Shell transports implementing the core's `RemoteShell` seam.

mod local;
mod quote;
mod ssh;

pub use local::LocalShell;
pub use quote::{quote, remote_invocation};
pub use ssh::{SshShell, SshTarget};

use std::sync::Arc;
use std::time::Duration;

use oversight::RemoteShell;

use crate::config::TransportConfig;

/// Build the configured transport.
pub fn from_config(config: &TransportConfig) -> Arc<dyn RemoteShell> {
    match config.kind.as_str() {
        "ssh" => {
            let mut target = SshTarget::new(config.host.clone(), config.user.clone());
            target.port = config.port;
            target.identity_file = config.identity_file.clone();
            target.connect_timeout = Duration::from_secs(config.connect_timeout_seconds);
            Arc::new(SshShell::new(target))
        }
        _ => Arc::new(LocalShell::new()),
    }
}
