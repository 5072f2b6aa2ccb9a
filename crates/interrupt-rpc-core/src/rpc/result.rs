//! Outcome of a remote invocation.

use crate::error::ApplicationError;
use serde::{Deserialize, Serialize};

/// Result of one invocation, as packaged by the dispatcher.
///
/// `is_interrupted` is the worker's cancellation token sampled when the
/// result was built. `interrupt_was_requested` records whether the caller's
/// cancellation byte was read before that point; it can be `true` for a
/// `Success` when the invocation ignored the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResult<T = serde_json::Value> {
    Success {
        value: T,
        is_interrupted: bool,
        interrupt_was_requested: bool,
    },
    Failure {
        error: ApplicationError,
        is_interrupted: bool,
        interrupt_was_requested: bool,
    },
}

impl<T> RpcResult<T> {
    /// Package an invocation outcome together with its interruption state.
    pub fn from_outcome(
        outcome: std::result::Result<T, ApplicationError>,
        is_interrupted: bool,
        interrupt_was_requested: bool,
    ) -> Self {
        match outcome {
            Ok(value) => RpcResult::Success {
                value,
                is_interrupted,
                interrupt_was_requested,
            },
            Err(error) => RpcResult::Failure {
                error,
                is_interrupted,
                interrupt_was_requested,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RpcResult::Success { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        match self {
            RpcResult::Success { is_interrupted, .. }
            | RpcResult::Failure { is_interrupted, .. } => *is_interrupted,
        }
    }

    pub fn interrupt_was_requested(&self) -> bool {
        match self {
            RpcResult::Success {
                interrupt_was_requested,
                ..
            }
            | RpcResult::Failure {
                interrupt_was_requested,
                ..
            } => *interrupt_was_requested,
        }
    }

    /// Drop the metadata and keep the outcome.
    pub fn into_outcome(self) -> std::result::Result<T, ApplicationError> {
        match self {
            RpcResult::Success { value, .. } => Ok(value),
            RpcResult::Failure { error, .. } => Err(error),
        }
    }

    /// Convert the success value, keeping the metadata.
    pub fn try_map<U, E>(
        self,
        f: impl FnOnce(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<RpcResult<U>, E> {
        Ok(match self {
            RpcResult::Success {
                value,
                is_interrupted,
                interrupt_was_requested,
            } => RpcResult::Success {
                value: f(value)?,
                is_interrupted,
                interrupt_was_requested,
            },
            RpcResult::Failure {
                error,
                is_interrupted,
                interrupt_was_requested,
            } => RpcResult::Failure {
                error,
                is_interrupted,
                interrupt_was_requested,
            },
        })
    }
}
