//! Connection pool implementation.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::lifecycle::{ConnectionMetadata, ConnectionState, Connector, HealthCheckResult};

/// Builder for [`Pool`].
///
/// ```rust,ignore
/// let pool = PoolBuilder::new()
///     .min_connections(2)
///     .max_connections(10)
///     .build(connector)
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Run the health check on idle connections before handing them out.
    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.config.test_on_checkout = enabled;
        self
    }

    /// Set the health check query.
    #[must_use]
    pub fn health_check_query(mut self, query: impl Into<Arc<str>>) -> Self {
        self.config.health_check_query = query.into();
        self
    }

    /// Validate the configuration, open the initial connections and return the pool.
    pub async fn build<K: Connector>(self, connector: K) -> Result<Pool<K>> {
        Pool::new(connector, self.config).await
    }
}

/// A bounded pool of connections produced by a [`Connector`].
///
/// The pool hands out [`PooledConnection`]s that return themselves on drop.
/// At most `max_connections` connections are checked out at once; further
/// callers wait until one is returned or their timeout elapses.
///
/// Cloning a `Pool` is cheap and yields another handle to the same pool.
pub struct Pool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

struct PoolInner<K: Connector> {
    connector: K,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection<K::Connection>>>,
    semaphore: Arc<Semaphore>,
    in_use: AtomicU32,
    // Written only while holding `idle`, so a returning connection can never
    // slip into the idle queue after `close` drained it.
    closed: AtomicBool,
    next_id: AtomicU64,
}

struct IdleConnection<C> {
    conn: C,
    meta: ConnectionMetadata,
}

impl<K: Connector> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: Connector> Pool<K> {
    /// Create a pool and eagerly open its initial connections.
    ///
    /// Fails fast: if any initial connection cannot be established within
    /// the connection timeout, the ones already opened are closed and the
    /// error is returned.
    pub async fn new(connector: K, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let initial = config.initial_connections();
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            connector,
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });
        let pool = Self { inner };

        let connect_timeout = pool.inner.config.connection_timeout;
        for _ in 0..initial {
            let opened = tokio::time::timeout(connect_timeout, pool.inner.open())
                .await
                .unwrap_or_else(|_| {
                    Err(PoolError::ConnectionCreation(format!(
                        "connect timed out after {connect_timeout:?}"
                    )))
                });
            match opened {
                Ok(idle) => pool.inner.idle.lock().push_back(idle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open initial pool connections");
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            connections = initial,
            max = pool.inner.config.max_connections,
            "connection pool ready"
        );
        Ok(pool)
    }

    /// Get a connection from the pool using the configured connection timeout.
    pub async fn get(&self) -> Result<PooledConnection<K>> {
        self.get_timeout(self.inner.config.connection_timeout).await
    }

    /// Get a connection from the pool, waiting at most `timeout`.
    ///
    /// This will either return an existing idle connection or open a new one
    /// if the pool is not at capacity. If all connections are in use, it waits
    /// until one is returned.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<PooledConnection<K>> {
        tokio::time::timeout(timeout, self.checkout())
            .await
            .map_err(|_| PoolError::AcquisitionTimeout(timeout))?
    }

    /// Try to check out an idle connection without waiting.
    ///
    /// Returns `Ok(None)` when the pool is at capacity or has no idle
    /// connection; this never opens a new connection.
    pub fn try_get(&self) -> Result<Option<PooledConnection<K>>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::PoolClosed),
            Err(TryAcquireError::NoPermits) => return Ok(None),
        };

        loop {
            let Some(idle) = self.inner.idle.lock().pop_front() else {
                return Ok(None);
            };
            if self.inner.is_reusable(&idle) {
                return Ok(Some(PoolInner::lease(&self.inner, idle, permit)));
            }
            tracing::debug!(connection_id = idle.meta.id, "dropping stale idle connection");
            PoolInner::retire(&self.inner, idle.conn, idle.meta.id);
        }
    }

    /// Check the backend with the configured health check query.
    ///
    /// An idle connection is checked when there is one; a connection that
    /// fails the check is discarded. When no idle connection is available,
    /// a dedicated connection is opened outside the pool's capacity, checked
    /// and closed again, so a busy pool is not mistaken for a dead backend.
    /// `timeout` bounds the whole check.
    pub async fn health_check(&self, timeout: Duration) -> HealthCheckResult {
        let started = Instant::now();
        let check = async {
            match self.try_get()? {
                Some(mut conn) => {
                    conn.meta.state = ConnectionState::Checking;
                    let result = self
                        .inner
                        .connector
                        .health_check(&mut *conn, &self.inner.config.health_check_query)
                        .await;
                    conn.meta.mark_health_check(result.is_ok());
                    if result.is_ok() {
                        conn.meta.state = ConnectionState::InUse;
                    }
                    result
                }
                None => self.inner.check_dedicated().await,
            }
        };

        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(())) => HealthCheckResult::healthy(started.elapsed()),
            Ok(Err(e)) => HealthCheckResult::unhealthy(started.elapsed(), e.to_string()),
            Err(_) => HealthCheckResult::unhealthy(
                started.elapsed(),
                format!("health check timed out after {timeout:?}"),
            ),
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let available = self.inner.idle.lock().len() as u32;
        let in_use = self.inner.in_use.load(Ordering::Acquire);
        PoolStatus {
            available,
            in_use,
            total: available + in_use,
            max: self.inner.config.max_connections,
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed through the connector and waiters are
    /// woken with [`PoolError::PoolClosed`]. Connections still checked out
    /// are dropped when they are returned. Calling this more than once is a
    /// no-op.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        self.inner.semaphore.close();

        let count = drained.len();
        for idle in drained {
            if let Err(e) = self.inner.connector.close(idle.conn).await {
                tracing::debug!(connection_id = idle.meta.id, error = %e, "error closing connection");
            }
        }

        tracing::info!(
            closed = count,
            outstanding = self.inner.in_use.load(Ordering::Acquire),
            "connection pool closed"
        );
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connector backing this pool.
    #[must_use]
    pub fn connector(&self) -> &K {
        &self.inner.connector
    }

    async fn checkout(&self) -> Result<PooledConnection<K>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::PoolClosed)?;
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let idle = match self.inner.take_idle().await {
            Some(idle) => idle,
            None => self.inner.open().await?,
        };
        Ok(PoolInner::lease(&self.inner, idle, permit))
    }
}

impl<K: Connector> PoolInner<K> {
    async fn open(&self) -> Result<IdleConnection<K::Connection>> {
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(connection_id = id, "opened pool connection");
        Ok(IdleConnection {
            conn,
            meta: ConnectionMetadata::new(id),
        })
    }

    /// Open a connection that never enters the pool, check it and close it.
    async fn check_dedicated(&self) -> Result<()> {
        tracing::debug!("pool saturated, checking a dedicated connection");
        let mut conn = self.connector.connect().await?;
        let result = self
            .connector
            .health_check(&mut conn, &self.config.health_check_query)
            .await;
        if let Err(e) = self.connector.close(conn).await {
            tracing::debug!(error = %e, "error closing health check connection");
        }
        result
    }

    fn is_reusable(&self, idle: &IdleConnection<K::Connection>) -> bool {
        self.connector.is_valid(&idle.conn)
            && !idle.meta.is_expired(self.config.max_lifetime)
            && !idle.meta.is_idle_expired(self.config.idle_timeout)
    }

    async fn take_idle(&self) -> Option<IdleConnection<K::Connection>> {
        loop {
            let mut idle = self.idle.lock().pop_front()?;
            if self.is_reusable(&idle) {
                if !self.config.test_on_checkout {
                    return Some(idle);
                }
                let checked = self
                    .connector
                    .health_check(&mut idle.conn, &self.config.health_check_query)
                    .await;
                idle.meta.mark_health_check(checked.is_ok());
                match checked {
                    Ok(()) => return Some(idle),
                    Err(e) => tracing::debug!(
                        connection_id = idle.meta.id,
                        error = %e,
                        "idle connection failed checkout test"
                    ),
                }
            } else {
                tracing::debug!(connection_id = idle.meta.id, "discarding stale idle connection");
            }
            if let Err(e) = self.connector.close(idle.conn).await {
                tracing::debug!(error = %e, "error closing stale connection");
            }
        }
    }

    fn lease(
        this: &Arc<Self>,
        mut idle: IdleConnection<K::Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<K> {
        idle.meta.mark_checkout();
        this.in_use.fetch_add(1, Ordering::AcqRel);
        PooledConnection {
            conn: Some(idle.conn),
            meta: idle.meta,
            pool: Arc::clone(this),
            _permit: permit,
        }
    }

    fn checkin(this: &Arc<Self>, conn: K::Connection, mut meta: ConnectionMetadata) {
        this.in_use.fetch_sub(1, Ordering::AcqRel);

        // A health check that never finished leaves the connection in an unknown state.
        if meta.state == ConnectionState::Checking
            || meta.state.should_remove()
            || !this.connector.is_valid(&conn)
        {
            tracing::debug!(connection_id = meta.id, "discarding returned connection");
            Self::retire(this, conn, meta.id);
            return;
        }

        let mut idle = this.idle.lock();
        if this.closed.load(Ordering::Acquire) {
            drop(idle);
            tracing::trace!(connection_id = meta.id, "pool closed, closing returned connection");
            Self::retire(this, conn, meta.id);
            return;
        }
        meta.mark_checkin();
        tracing::trace!(connection_id = meta.id, "returning connection to pool");
        idle.push_back(IdleConnection { conn, meta });
    }

    /// Close a connection that leaves the pool from a synchronous context.
    ///
    /// Outside a Tokio runtime the connection is only dropped.
    fn retire(this: &Arc<Self>, conn: K::Connection, id: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(connection_id = id, "no runtime, dropping connection");
            return;
        };
        let pool = Arc::clone(this);
        runtime.spawn(async move {
            if let Err(e) = pool.connector.close(conn).await {
                tracing::debug!(connection_id = id, error = %e, "error closing connection");
            }
        });
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently checked out.
    pub in_use: u32,
    /// Total number of open connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

/// A connection checked out of a [`Pool`].
///
/// When dropped, the connection is returned to the pool, or dropped if the
/// pool has been closed in the meantime.
pub struct PooledConnection<K: Connector> {
    // Always `Some` until `detach` or `drop` takes it.
    conn: Option<K::Connection>,
    meta: ConnectionMetadata,
    pool: Arc<PoolInner<K>>,
    _permit: OwnedSemaphorePermit,
}

impl<K: Connector> PooledConnection<K> {
    /// Metadata the pool tracks for this connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    /// Detach the connection from the pool.
    ///
    /// The connection will not be returned to the pool and its slot is freed
    /// for a new connection.
    #[allow(clippy::expect_used)]
    pub fn detach(mut self) -> K::Connection {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
        self.conn.take().expect("connection present until detach")
    }

    /// Mark the connection as broken so it is discarded instead of returned.
    pub fn discard(&mut self) {
        self.meta.state = ConnectionState::Error;
    }

    /// Undo [`discard`](Self::discard): the connection goes back to the pool
    /// on drop.
    pub fn restore(&mut self) {
        if self.meta.state == ConnectionState::Error {
            self.meta.state = ConnectionState::InUse;
        }
    }

    /// Whether the connection will be discarded instead of returned.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.meta.state.should_remove()
    }
}

impl<K: Connector> Deref for PooledConnection<K> {
    type Target = K::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<K: Connector> DerefMut for PooledConnection<K> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<K: Connector> fmt::Debug for PooledConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.meta)
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            PoolInner::checkin(&self.pool, conn, self.meta.clone());
        }
    }
}
