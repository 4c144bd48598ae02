//! Connection lifecycle management.
//!
//! This module defines the [`Connector`] trait the pool uses to open, check
//! and close backend connections, plus the bookkeeping types the pool keeps
//! for every connection it owns.

use std::time::{Duration, Instant};

use crate::error::PoolError;

/// Opens and maintains connections for one kind of backend.
///
/// The pool never inspects a connection itself; everything it needs to know
/// goes through this trait. Returned futures are `Send`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection type handed out by the pool.
    type Connection: Send + 'static;

    /// Establish a new connection, including any handshake or authentication.
    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Run a lightweight liveness check on the connection.
    ///
    /// `query` is the configured health check query or command.
    async fn health_check(&self, conn: &mut Self::Connection, query: &str)
    -> Result<(), PoolError>;

    /// Close a connection that is leaving the pool.
    ///
    /// The default implementation simply drops it.
    async fn close(&self, conn: Self::Connection) -> Result<(), PoolError> {
        drop(conn);
        Ok(())
    }

    /// Cheap synchronous validity check, e.g. whether the socket is still open.
    fn is_valid(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

/// Health check result with timing information.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Whether the health check passed.
    pub healthy: bool,
    /// Time taken to complete the health check.
    pub latency: Duration,
    /// Error message if unhealthy.
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Create a successful health check result.
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    /// Create a failed health check result.
    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is idle and available for use.
    Idle,
    /// Connection is checked out.
    InUse,
    /// Connection is being health-checked.
    Checking,
    /// Connection is closed and should be removed.
    Closed,
    /// Connection failed a check and should be removed.
    Error,
}

impl ConnectionState {
    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the connection is currently busy.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::InUse | Self::Checking)
    }

    /// Check if the connection should be removed from the pool.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// When the connection was last health-checked.
    pub last_checked_at: Option<Instant>,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            last_checked_at: None,
            checkout_count: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() > idle_timeout
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
        self.state = ConnectionState::InUse;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
        self.state = ConnectionState::Idle;
    }

    /// Mark the connection as health-checked.
    pub fn mark_health_check(&mut self, healthy: bool) {
        self.last_checked_at = Some(Instant::now());
        if !healthy {
            self.state = ConnectionState::Error;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_availability() {
        assert!(ConnectionState::Idle.is_available());
        assert!(!ConnectionState::InUse.is_available());
        assert!(!ConnectionState::Checking.is_available());
    }

    #[test]
    fn test_connection_state_should_remove() {
        assert!(!ConnectionState::Idle.should_remove());
        assert!(!ConnectionState::InUse.should_remove());
        assert!(ConnectionState::Closed.should_remove());
        assert!(ConnectionState::Error.should_remove());
    }

    #[test]
    fn test_connection_metadata_checkout_checkin() {
        let mut meta = ConnectionMetadata::new(7);
        assert_eq!(meta.state, ConnectionState::Idle);

        meta.mark_checkout();
        assert_eq!(meta.checkout_count, 1);
        assert!(meta.state.is_busy());

        meta.mark_checkin();
        assert_eq!(meta.state, ConnectionState::Idle);
    }

    #[test]
    fn test_failed_health_check_marks_error() {
        let mut meta = ConnectionMetadata::new(1);
        meta.mark_health_check(false);
        assert!(meta.last_checked_at.is_some());
        assert!(meta.state.should_remove());
    }

    #[test]
    fn test_expiry() {
        let meta = ConnectionMetadata::new(1);
        assert!(!meta.is_expired(Duration::from_secs(60)));
        assert!(!meta.is_idle_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_health_check_result() {
        let ok = HealthCheckResult::healthy(Duration::from_millis(5));
        assert!(ok.healthy);
        assert!(ok.error.is_none());

        let failed = HealthCheckResult::unhealthy(Duration::from_millis(1000), "timeout");
        assert!(!failed.healthy);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
    }
}
