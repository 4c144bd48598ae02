//! Resource lifecycle error types.

use std::fmt;
use std::time::Duration;

use lifespan_pool::PoolError;
use thiserror::Error;

use crate::state::LifecycleState;

/// Errors that can occur while starting, using or stopping resources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration. Never retryable; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The resource could not be reached while building its pool.
    #[error("failed to connect to {resource}: {message}")]
    Connect {
        /// Resource name.
        resource: String,
        /// Underlying failure.
        message: String,
    },

    /// A liveness check failed or timed out.
    #[error("{resource} is unavailable: {message}")]
    Unavailable {
        /// Resource name.
        resource: String,
        /// Underlying failure.
        message: String,
    },

    /// A handle was requested outside the ready state.
    #[error("{resource} is not ready (state: {state})")]
    NotReady {
        /// Resource name.
        resource: String,
        /// State the resource was in.
        state: LifecycleState,
    },

    /// No connection became available in time.
    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the acquisition or the request.
    #[error("operation cancelled")]
    Cancelled,

    /// A handle was released twice. Indicates a bug in the caller.
    #[error("handle for connection {connection_id} of {resource} released more than once")]
    DoubleRelease {
        /// Resource name.
        resource: String,
        /// Pool connection the handle was leasing.
        connection_id: u64,
    },

    /// `initialize` was called on a manager that already has a pool.
    #[error("{0} is already initialized")]
    AlreadyInitialized(String),

    /// A lifecycle operation was attempted from the wrong state.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// The handle no longer holds a connection.
    #[error("handle has already been released")]
    HandleReleased,

    /// The owning manager forced its shutdown while the handle was out.
    ///
    /// The connection has been taken back and closed; the handle must only be
    /// released.
    #[error("handle for {resource} was invalidated by a forced shutdown")]
    HandleInvalidated {
        /// Resource name.
        resource: String,
    },

    /// A handle was passed to a manager that did not issue it.
    #[error("handle issued by {owner} was released through {resource}")]
    ForeignHandle {
        /// The manager the handle was released through.
        resource: String,
        /// The manager that issued the handle.
        owner: String,
    },

    /// Beginning, committing, or rolling back a transaction failed.
    #[error("transaction on {resource} failed: {message}")]
    Transaction {
        /// Resource name.
        resource: String,
        /// Driver error text.
        message: String,
    },

    /// Startup failed and the already-started resources were unwound.
    #[error("startup failed at {resource}: {source} ({} unwind error(s))", .unwind.len())]
    Startup {
        /// Resource whose startup failed.
        resource: String,
        /// The startup failure.
        source: Box<Error>,
        /// Every error raised while closing resources during the unwind.
        unwind: Vec<ResourceFailure>,
    },

    /// One or more resources failed to shut down cleanly.
    #[error("shutdown reported {} failure(s)", .failures.len())]
    Shutdown {
        /// Every failure, in the order the resources were closed.
        failures: Vec<ResourceFailure>,
    },
}

impl Error {
    /// Map a pool error onto the lifecycle taxonomy for `resource`.
    pub fn from_pool(resource: &str, error: PoolError) -> Self {
        match error {
            PoolError::AcquisitionTimeout(timeout) => Self::Timeout(timeout),
            PoolError::PoolClosed => Self::NotReady {
                resource: resource.to_owned(),
                state: LifecycleState::Stopped,
            },
            PoolError::ConnectionCreation(message) => Self::Connect {
                resource: resource.to_owned(),
                message,
            },
            PoolError::UnhealthyConnection(message) => Self::Unavailable {
                resource: resource.to_owned(),
                message,
            },
            PoolError::Configuration(message) => Self::Config(message),
        }
    }

    /// Check if this error is transient and the caller may retry.
    ///
    /// Only acquisition timeouts and cancellations qualify; everything else
    /// either needs operator action or indicates a bug.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Cancelled)
    }

    /// Check if this error must abort process startup.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Connect { .. } | Self::Unavailable { .. } | Self::Startup { .. }
        )
    }

    /// Check if this error indicates misuse by a collaborator rather than a
    /// resource problem.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::DoubleRelease { .. }
                | Self::AlreadyInitialized(_)
                | Self::InvalidTransition { .. }
                | Self::HandleReleased
                | Self::ForeignHandle { .. }
        )
    }

    /// Check if the request should be answered with "service unavailable".
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotReady { .. } | Self::Unavailable { .. } | Self::HandleInvalidated { .. }
        )
    }
}

/// An error attributed to a named resource.
#[derive(Debug)]
pub struct ResourceFailure {
    /// Resource name.
    pub resource: String,
    /// What went wrong.
    pub error: Error,
}

impl ResourceFailure {
    pub(crate) fn new(resource: impl Into<String>, error: Error) -> Self {
        Self {
            resource: resource.into(),
            error,
        }
    }
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// Result type for resource lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
