//! Override points of [`RpcServer`](super::RpcServer).
//!
//! Hooks are plain function values injected through the server builder.
//! `was_closed_locally` tells a hook whether the server had already been
//! closed by its owner when the fault happened, which separates a normal
//! shutdown from a genuine failure.

use crate::{Result, RpcError};
use std::sync::Arc;
use tracing::{debug, error};

/// Receives `(was_closed_locally, cause)`. Returning `Err` re-raises.
pub type FaultHook = Arc<dyn Fn(bool, RpcError) -> Result<()> + Send + Sync>;

/// Receives a [`RpcError::StopHookViolation`].
pub type ViolationHook = Arc<dyn Fn(&RpcError) + Send + Sync>;

#[derive(Clone)]
pub struct ServerHooks {
    /// Called once when the accept loop exits. The accept loop returns the
    /// hook's result; `RpcServer::close` hands it to its caller.
    pub on_shutdown: FaultHook,
    /// Called when a connection fails mid-call (unreadable invocation,
    /// protocol violation, undeliverable result). An `Err` ends that
    /// connection's handler with the error; other connections are unaffected.
    pub on_communication_fault: FaultHook,
    /// Called when a worker outlives its connection after the stop hook ran.
    pub on_stop_violation: ViolationHook,
}

impl Default for ServerHooks {
    fn default() -> Self {
        Self {
            on_shutdown: Arc::new(reraise_unless_closed_locally),
            on_communication_fault: Arc::new(reraise_unless_closed_locally),
            on_stop_violation: Arc::new(log_stop_violation),
        }
    }
}

impl std::fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHooks").finish_non_exhaustive()
    }
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_shutdown(
        mut self,
        hook: impl Fn(bool, RpcError) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_shutdown = Arc::new(hook);
        self
    }

    pub fn with_on_communication_fault(
        mut self,
        hook: impl Fn(bool, RpcError) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_communication_fault = Arc::new(hook);
        self
    }

    pub fn with_on_stop_violation(
        mut self,
        hook: impl Fn(&RpcError) + Send + Sync + 'static,
    ) -> Self {
        self.on_stop_violation = Arc::new(hook);
        self
    }
}

/// Default fault policy: silent after a local close, re-raise otherwise.
pub fn reraise_unless_closed_locally(was_closed_locally: bool, cause: RpcError) -> Result<()> {
    if was_closed_locally {
        debug!("Ignoring fault after local close: {}", cause);
        Ok(())
    } else {
        Err(cause)
    }
}

/// Default stop-violation policy: log at error level.
pub fn log_stop_violation(violation: &RpcError) {
    error!("Leaked invocation worker: {}", violation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_reraises_only_external_faults() {
        let hooks = ServerHooks::default();

        assert!((hooks.on_shutdown)(true, RpcError::communication("closed")).is_ok());
        let err = (hooks.on_shutdown)(false, RpcError::communication("listener died")).unwrap_err();
        assert!(err.to_string().contains("listener died"));

        assert!((hooks.on_communication_fault)(true, RpcError::communication("eof")).is_ok());
        assert!((hooks.on_communication_fault)(false, RpcError::communication("eof")).is_err());
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let hooks = ServerHooks::new().with_on_shutdown(|_, _| Ok(()));
        assert!((hooks.on_shutdown)(false, RpcError::communication("listener died")).is_ok());
    }
}
