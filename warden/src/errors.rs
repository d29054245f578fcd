//! Error types shared across the orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type WardenResult<T> = Result<T, WardenError>;

/// Errors surfaced by warden components.
///
/// Validation and state-conflict errors are raised before any mutation
/// and are safe for callers to retry after correcting the input. Command
/// failures carry the command line and stderr so the operator can see
/// exactly which OS-level call broke.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Malformed input (IP, CIDR, size, port, hostname) caught before
    /// any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced container, partition, or dataset does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition conflicts with current state
    /// (destroy-while-running, duplicate uuid exhaustion, missing
    /// primary interface).
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// An external command exited non-zero.
    #[error("command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// An external command exceeded its deadline and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// No free address was found within the bounded retry count.
    #[error("address pool exhausted after {0} attempts")]
    PoolExhausted(usize),

    /// A firewall or proxy apply/reload step failed; the previous
    /// generated state was left in place.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// The property store itself could not be queried. Distinct from a
    /// key being absent, which is `Ok(None)`.
    #[error("property store unavailable: {0}")]
    StoreUnavailable(String),

    /// A declared feature that must fail loudly rather than silently.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// True for errors raised before any side effect took place.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            WardenError::Validation(_) | WardenError::StateConflict(_) | WardenError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_formats_command_and_stderr() {
        let err = WardenError::CommandFailed {
            command: "zfs list tank/missing".into(),
            status: 1,
            stderr: "dataset does not exist".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("zfs list tank/missing"));
        assert!(msg.contains("dataset does not exist"));
    }

    #[test]
    fn pre_mutation_classification() {
        assert!(WardenError::Validation("bad cidr".into()).is_pre_mutation());
        assert!(WardenError::StateConflict("running".into()).is_pre_mutation());
        assert!(!WardenError::ApplyFailed("reload".into()).is_pre_mutation());
    }
}
