//! Resource manager.
//!
//! A [`ResourceManager`] owns the pool of one resource type and decides when
//! handles may be issued. Readiness and the in-flight handle count live under
//! one lock so that "is the manager ready?" and "count this acquisition" are a
//! single atomic step: once [`close`](ResourceManager::close) has flipped the
//! readiness flag, no acquisition that starts afterwards can succeed.
//!
//! A manager registered with a [`LifecycleCoordinator`](crate::LifecycleCoordinator)
//! also consults the process-wide state: it issues handles only while both
//! its own state and the process state are ready.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use lifespan_pool::{Connector, HealthCheckResult, Pool, PoolStatus};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceConfig;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::state::LifecycleState;
use crate::transaction::Transactional;

/// Per-call acquisition options.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Maximum time to wait for a connection; defaults to the configured
    /// acquire timeout.
    pub timeout: Option<Duration>,
    /// Cancels the acquisition (and, in scoped use, the request) when fired.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    /// Options using the configured timeout and no cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the acquisition timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// How a [`ResourceManager::close`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Every handle was released before the pool was closed.
    Drained,
    /// The drain timeout elapsed and the pool was closed with handles still out.
    ///
    /// Those handles are invalid; releasing them later is a no-op.
    Forced {
        /// Handles still checked out when the pool was closed.
        outstanding: usize,
    },
}

impl CloseOutcome {
    /// Whether the close had to abandon outstanding handles.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Forced { .. })
    }
}

/// Owns the pool for one resource type and issues request-scoped handles.
///
/// Cloning is cheap; clones share the same pool and state.
pub struct ResourceManager<K: Connector> {
    shared: Arc<Shared<K>>,
}

pub(crate) struct Shared<K: Connector> {
    pub(crate) name: String,
    config: Arc<ResourceConfig>,
    pool: OnceLock<Pool<K>>,
    state: Mutex<ManagerState>,
    in_flight_tx: watch::Sender<usize>,
    shutdown: CancellationToken,
    process: Option<Arc<Mutex<LifecycleState>>>,
}

#[derive(Debug, Default)]
struct ManagerState {
    phase: LifecycleState,
    in_flight: usize,
    closing: bool,
    forced: bool,
}

impl<K: Connector> Clone for ResourceManager<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Connector> std::fmt::Debug for ResourceManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<K: Connector> ResourceManager<K> {
    /// Create an uninitialized manager.
    pub fn new(name: impl Into<String>, config: impl Into<Arc<ResourceConfig>>) -> Self {
        Self::build(name.into(), config.into(), None)
    }

    /// Create a manager gated on a process-wide state owned by a coordinator.
    pub(crate) fn with_process_state(
        name: String,
        config: Arc<ResourceConfig>,
        process: Arc<Mutex<LifecycleState>>,
    ) -> Self {
        Self::build(name, config, Some(process))
    }

    fn build(
        name: String,
        config: Arc<ResourceConfig>,
        process: Option<Arc<Mutex<LifecycleState>>>,
    ) -> Self {
        let (in_flight_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                pool: OnceLock::new(),
                state: Mutex::new(ManagerState::default()),
                in_flight_tx,
                shutdown: CancellationToken::new(),
                process,
            }),
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configuration this manager was created with.
    #[must_use]
    pub fn config(&self) -> &Arc<ResourceConfig> {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state.lock().phase
    }

    /// Whether handles may currently be issued.
    ///
    /// A coordinated manager is ready only once the process is ready too.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.admission(&state).is_ok()
    }

    /// Number of acquisitions in progress plus handles checked out.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// Pool status, if a pool is installed.
    #[must_use]
    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.shared.pool.get().map(Pool::status)
    }

    /// Install the pool and verify it.
    ///
    /// The manager becomes ready only if the startup health check succeeds.
    /// A failed check leaves the pool installed but the manager not ready;
    /// the caller is expected to [`close`](Self::close) it.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] if a pool was already installed or the
    ///   manager has left the uninitialized state. The rejected pool is closed.
    /// - [`Error::Unavailable`] if the startup health check fails.
    pub async fn initialize(&self, pool: Pool<K>) -> Result<()> {
        let rejected = {
            let state = self.shared.state.lock();
            if state.phase == LifecycleState::Uninitialized {
                self.shared.pool.set(pool).err()
            } else {
                Some(pool)
            }
        };
        if let Some(pool) = rejected {
            tracing::warn!(resource = %self.shared.name, "initialize called twice");
            pool.close().await;
            return Err(Error::AlreadyInitialized(self.shared.name.clone()));
        }

        let result = self.check().await.inspect_err(|e| {
            tracing::error!(resource = %self.shared.name, error = %e, "startup health check failed");
        })?;

        let mut state = self.shared.state.lock();
        if state.phase != LifecycleState::Uninitialized {
            // close() won the race while the check was running
            return Err(Error::InvalidTransition {
                from: state.phase,
                to: LifecycleState::Ready,
            });
        }
        state.phase = LifecycleState::Ready;
        tracing::info!(
            resource = %self.shared.name,
            latency_ms = result.latency.as_millis() as u64,
            "resource ready"
        );
        Ok(())
    }

    /// Run a liveness check against the pool.
    ///
    /// After startup the result is advisory: a failure is reported but does
    /// not change readiness.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if no pool is installed or the manager is stopped.
    /// - [`Error::Unavailable`] on check failure or timeout.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let state = self.state();
        if state == LifecycleState::Stopped {
            return Err(self.not_ready(state));
        }
        self.check().await.inspect_err(|e| {
            tracing::warn!(resource = %self.shared.name, error = %e, "health check failed");
        })
    }

    /// Acquire a handle.
    ///
    /// Suspends the calling task until a connection is available, the
    /// timeout elapses, the caller's token is cancelled or shutdown begins.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the manager or the process is not ready, or
    ///   becomes not ready while waiting.
    /// - [`Error::Timeout`] if no connection became available in time.
    /// - [`Error::Cancelled`] if the caller's token fired.
    /// - [`Error::Connect`] if a new connection had to be opened and failed.
    pub async fn acquire(&self, options: AcquireOptions) -> Result<Handle<K>> {
        let reservation = self.reserve()?;
        let pool = self
            .shared
            .pool
            .get()
            .ok_or_else(|| self.not_ready(LifecycleState::Uninitialized))?;
        let timeout = options.timeout.unwrap_or(self.shared.config.acquire_timeout);

        let conn = tokio::select! {
            biased;
            () = self.shared.shutdown.cancelled() => {
                return Err(self.not_ready(LifecycleState::Draining));
            }
            () = cancelled(options.cancel.as_ref()) => {
                tracing::debug!(resource = %self.shared.name, "acquisition cancelled");
                return Err(Error::Cancelled);
            }
            result = pool.get_timeout(timeout) => {
                result.map_err(|e| Error::from_pool(&self.shared.name, e))?
            }
        };

        {
            let state = self.shared.state.lock();
            if let Err(phase) = self.shared.admission(&state) {
                drop(state);
                drop(conn);
                return Err(self.not_ready(phase));
            }
            reservation.commit();
        }

        tracing::trace!(
            resource = %self.shared.name,
            connection_id = conn.metadata().id,
            "handle acquired"
        );
        Ok(Handle::new(Arc::clone(&self.shared), conn))
    }

    /// Release a handle back to its pool.
    ///
    /// # Errors
    ///
    /// - [`Error::ForeignHandle`] if the handle was issued by another
    ///   manager. The handle is left untouched.
    /// - [`Error::DoubleRelease`] if the handle was already released, unless
    ///   the manager was force-closed, in which case this is a no-op.
    pub fn release(&self, handle: &mut Handle<K>) -> Result<()> {
        if !handle.is_issued_by(&self.shared) {
            tracing::error!(
                resource = %self.shared.name,
                owner = %handle.resource(),
                connection_id = handle.connection_id(),
                "handle released through a manager that did not issue it"
            );
            return Err(Error::ForeignHandle {
                resource: self.shared.name.clone(),
                owner: handle.resource().to_owned(),
            });
        }
        handle.release()
    }

    /// Run `body` with a handle that is released on every exit path.
    ///
    /// See [`with_handle`](crate::with_handle).
    pub async fn with_handle<T, E, F>(
        &self,
        options: AcquireOptions,
        body: F,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
        F: for<'h> FnOnce(&'h mut Handle<K>) -> BoxFuture<'h, std::result::Result<T, E>>,
    {
        crate::scope::with_handle(self, options, body).await
    }

    /// Run `body` on a connection inside a transaction.
    ///
    /// See [`with_transaction`](crate::with_transaction).
    pub async fn with_transaction<T, E, F>(
        &self,
        options: AcquireOptions,
        body: F,
    ) -> std::result::Result<T, E>
    where
        K::Connection: Transactional,
        E: From<Error>,
        F: for<'c> FnOnce(&'c mut K::Connection) -> BoxFuture<'c, std::result::Result<T, E>>,
    {
        crate::transaction::with_transaction(self, options, body).await
    }

    /// Stop issuing handles without waiting for outstanding ones.
    ///
    /// Waiters blocked in [`acquire`](Self::acquire) fail with
    /// [`Error::NotReady`]. [`close`](Self::close) still has to be called.
    pub fn begin_drain(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.phase.can_transition_to(LifecycleState::Draining) {
                return;
            }
            state.phase = LifecycleState::Draining;
            tracing::info!(
                resource = %self.shared.name,
                in_flight = state.in_flight,
                "resource draining"
            );
        }
        self.shared.shutdown.cancel();
    }

    /// Stop issuing handles, wait for outstanding ones and close the pool.
    ///
    /// Waits until every handle is released or `drain_timeout` elapses,
    /// whichever comes first, then closes the pool. If handles were still
    /// out, the result is [`CloseOutcome::Forced`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] if the manager is already closing or
    /// stopped; the pool is never closed twice.
    pub async fn close(&self, drain_timeout: Duration) -> Result<CloseOutcome> {
        {
            let mut state = self.shared.state.lock();
            if state.closing || state.phase == LifecycleState::Stopped {
                return Err(Error::InvalidTransition {
                    from: state.phase,
                    to: LifecycleState::Stopped,
                });
            }
            state.closing = true;
        }
        self.begin_drain();

        let mut in_flight = self.shared.in_flight_tx.subscribe();
        let drained = tokio::time::timeout(drain_timeout, in_flight.wait_for(|n| *n == 0))
            .await
            .is_ok();

        let outstanding = {
            let mut state = self.shared.state.lock();
            if !drained {
                state.forced = true;
            }
            state.in_flight
        };

        if let Some(pool) = self.shared.pool.get() {
            pool.close().await;
        }

        self.shared.state.lock().phase = LifecycleState::Stopped;

        if drained {
            tracing::info!(resource = %self.shared.name, "resource stopped");
            Ok(CloseOutcome::Drained)
        } else {
            tracing::warn!(
                resource = %self.shared.name,
                outstanding,
                timeout_ms = drain_timeout.as_millis() as u64,
                "drain timeout elapsed, forcing shutdown"
            );
            Ok(CloseOutcome::Forced { outstanding })
        }
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let pool = self
            .shared
            .pool
            .get()
            .ok_or_else(|| self.not_ready(LifecycleState::Uninitialized))?;
        let result = pool
            .health_check(self.shared.config.health_check_timeout)
            .await;
        if result.healthy {
            tracing::debug!(
                resource = %self.shared.name,
                latency_ms = result.latency.as_millis() as u64,
                "health check passed"
            );
            Ok(result)
        } else {
            Err(Error::Unavailable {
                resource: self.shared.name.clone(),
                message: result
                    .error
                    .unwrap_or_else(|| "health check failed".to_owned()),
            })
        }
    }

    /// Check readiness and count the acquisition in one step.
    fn reserve(&self) -> Result<Reservation<'_, K>> {
        let mut state = self.shared.state.lock();
        if let Err(phase) = self.shared.admission(&state) {
            return Err(self.not_ready(phase));
        }
        state.in_flight += 1;
        self.shared.in_flight_tx.send_replace(state.in_flight);
        Ok(Reservation {
            shared: &self.shared,
            committed: false,
        })
    }

    fn not_ready(&self, state: LifecycleState) -> Error {
        Error::NotReady {
            resource: self.shared.name.clone(),
            state,
        }
    }
}

impl<K: Connector> Shared<K> {
    /// Whether handles may be issued, given the locked manager state.
    ///
    /// On refusal returns the state to report: the manager's own phase, or
    /// the process state when only the process is holding acquisitions back.
    fn admission(&self, state: &ManagerState) -> std::result::Result<(), LifecycleState> {
        if !state.phase.accepts_acquisitions() {
            return Err(state.phase);
        }
        match &self.process {
            Some(process) => {
                let process = *process.lock();
                if process.accepts_acquisitions() {
                    Ok(())
                } else {
                    Err(process)
                }
            }
            None => Ok(()),
        }
    }

    /// Give back one in-flight unit.
    ///
    /// After a forced shutdown the count was abandoned, so late releases
    /// leave it alone.
    pub(crate) fn leave(&self) {
        let mut state = self.state.lock();
        if state.forced {
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        self.in_flight_tx.send_replace(state.in_flight);
    }

    pub(crate) fn is_forced(&self) -> bool {
        self.state.lock().forced
    }
}

/// An in-flight unit taken by `acquire` before it has a connection.
///
/// Dropped without `commit` (error, timeout, or the acquiring future being
/// dropped) it gives the unit back; committed, the unit moves to the handle.
struct Reservation<'a, K: Connector> {
    shared: &'a Shared<K>,
    committed: bool,
}

impl<K: Connector> Reservation<'_, K> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<K: Connector> Drop for Reservation<'_, K> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.leave();
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
