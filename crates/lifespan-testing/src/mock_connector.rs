//! In-memory connector for unit testing.
//!
//! [`MockConnector`] produces [`MockConnection`]s without any I/O. Clones
//! share their counters and fault switches, so a test can keep one clone
//! and flip switches while the pool owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lifespan::{ConnectionFactory, Error, ResourceConfig, Transactional};
use lifespan_pool::{Connector, PoolError};
use parking_lot::Mutex;

/// Connection string scheme accepted by [`MockFactory`].
pub const MOCK_SCHEME: &str = "mock://";

/// A fake connection that records the commands sent to it.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    executed: Vec<String>,
    fail_commit: bool,
}

impl MockConnection {
    /// Connector-assigned id, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record `command` as executed and echo it back.
    pub async fn execute(&mut self, command: &str) -> String {
        tokio::task::yield_now().await;
        self.executed.push(command.to_owned());
        command.to_owned()
    }

    /// Every command executed on this connection, health checks included.
    #[must_use]
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Make the next `COMMIT` on this connection fail.
    pub fn fail_next_commit(&mut self) {
        self.fail_commit = true;
    }
}

#[async_trait]
impl Transactional for MockConnection {
    type Error = PoolError;

    async fn begin(&mut self) -> Result<(), PoolError> {
        self.execute("BEGIN").await;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PoolError> {
        if std::mem::take(&mut self.fail_commit) {
            return Err(PoolError::UnhealthyConnection(format!(
                "COMMIT failed on connection {}",
                self.id
            )));
        }
        self.execute("COMMIT").await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PoolError> {
        self.execute("ROLLBACK").await;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    health_checks: AtomicUsize,
    next_id: AtomicU64,
    fail_connect: AtomicBool,
    fail_health: AtomicBool,
    connect_delay: Mutex<Duration>,
    health_delay: Mutex<Duration>,
    stall_after: Mutex<Option<usize>>,
}

/// Connector producing [`MockConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Create a connector that always succeeds instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of connections closed through [`Connector::close`].
    #[must_use]
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Number of health checks run.
    #[must_use]
    pub fn health_checks(&self) -> usize {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    /// Make every subsequent connect fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent health check fail.
    pub fn set_fail_health(&self, fail: bool) {
        self.state.fail_health.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Let `opens` connects succeed, then make every later connect hang.
    pub fn set_stall_after(&self, opens: usize) {
        *self.state.stall_after.lock() = Some(opens);
    }

    /// Delay every health check by `delay`.
    pub fn set_health_delay(&self, delay: Duration) {
        *self.state.health_delay.lock() = delay;
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, PoolError> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(PoolError::ConnectionCreation("connection refused".into()));
        }
        let stall_after = *self.state.stall_after.lock();
        if stall_after.is_some_and(|n| self.opened() >= n) {
            std::future::pending::<()>().await;
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(connection_id = id, "mock connection opened");
        Ok(MockConnection {
            id,
            executed: Vec::new(),
            fail_commit: false,
        })
    }

    async fn health_check(&self, conn: &mut MockConnection, query: &str) -> Result<(), PoolError> {
        self.state.health_checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.health_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_health.load(Ordering::SeqCst) {
            return Err(PoolError::UnhealthyConnection(format!(
                "'{query}' failed on connection {}",
                conn.id
            )));
        }
        conn.execute(query).await;
        Ok(())
    }

    async fn close(&self, conn: MockConnection) -> Result<(), PoolError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection_id = conn.id, "mock connection closed");
        Ok(())
    }
}

/// Factory handing out clones of one shared [`MockConnector`].
#[derive(Debug, Clone)]
pub struct MockFactory {
    connector: MockConnector,
    kind: &'static str,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    /// Create a factory with a fresh connector.
    #[must_use]
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// Create a factory reporting `kind` as its backend name.
    #[must_use]
    pub fn named(kind: &'static str) -> Self {
        Self {
            connector: MockConnector::new(),
            kind,
        }
    }

    /// The shared connector, for inspecting counters and flipping faults.
    #[must_use]
    pub fn mock(&self) -> &MockConnector {
        &self.connector
    }
}

impl ConnectionFactory for MockFactory {
    type Connector = MockConnector;

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn default_health_check(&self) -> &'static str {
        "PING"
    }

    fn connector(&self, config: &ResourceConfig) -> lifespan::Result<MockConnector> {
        if !config.connection_string.starts_with(MOCK_SCHEME) {
            return Err(Error::Config(format!(
                "mock connection string must start with {MOCK_SCHEME}"
            )));
        }
        Ok(self.connector.clone())
    }
}
