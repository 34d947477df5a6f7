//! POSIX quoting for commands crossing the ssh boundary.
//!
//! `ssh host <args...>` joins its arguments into one string and hands it
//! to the remote login shell, so every metacharacter we do not quote is
//! interpreted remotely. Single-quoting is the POSIX-standard answer:
//! inside `'...'` only `'` itself needs escaping, via the `'\''`
//! end-quote / escaped-quote / start-quote dance.

/// Quote one argument for safe inclusion in a remote shell string.
pub fn quote(arg: &str) -> String {
    let escaped = arg.replace('\'', "'\\''");
    format!("'{escaped}'")
}

/// Build the remote invocation that runs `command` under `sh -c` on the
/// far side, with the command string passed as a single quoted operand.
pub fn remote_invocation(command: &str) -> String {
    format!("sh -c {}", quote(command))
}
