//! Process-wide lifecycle coordination.
//!
//! The [`LifecycleCoordinator`] owns every [`ResourceManager`] of the
//! process. It starts them in registration order before the process accepts
//! work, and stops them in reverse order when it is asked to shut down.
//!
//! ## Startup
//!
//! Startup is all-or-nothing. If any resource fails to build or verify, the
//! resources are closed again in reverse order and [`Error::Startup`] carries
//! the original failure together with every error raised while unwinding.
//!
//! ## Readiness
//!
//! The coordinator owns the one process-wide [`LifecycleState`]. Every
//! manager it registers consults that state, so no handle is issued by any
//! resource until all of them are ready.
//!
//! ## Shutdown
//!
//! Shutdown first flips every resource to not-ready, so that no new handle
//! is issued anywhere, and then closes the resources one by one in reverse
//! registration order. All closes share a single drain deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use lifespan_pool::HealthCheckResult;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::ResourceConfig;
use crate::error::{Error, ResourceFailure, Result};
use crate::factory::{self, ConnectionFactory};
use crate::manager::{CloseOutcome, ResourceManager};
use crate::state::LifecycleState;

/// Default bound on closing resources after a failed startup.
pub const DEFAULT_UNWIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Type-erased view of one registered resource.
#[async_trait]
trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> LifecycleState;
    async fn start(&self) -> Result<()>;
    fn begin_drain(&self);
    async fn close(&self, drain_timeout: Duration) -> Result<CloseOutcome>;
    async fn health_check(&self) -> Result<HealthCheckResult>;
}

struct Registration<F: ConnectionFactory> {
    factory: F,
    manager: ResourceManager<F::Connector>,
}

#[async_trait]
impl<F: ConnectionFactory> ManagedResource for Registration<F> {
    fn name(&self) -> &str {
        self.manager.name()
    }

    fn state(&self) -> LifecycleState {
        self.manager.state()
    }

    async fn start(&self) -> Result<()> {
        let pool = factory::build(&self.factory, self.manager.config())
            .await
            .map_err(|e| match e {
                Error::Connect { message, .. } => Error::Connect {
                    resource: self.manager.name().to_owned(),
                    message,
                },
                other => other,
            })?;
        self.manager.initialize(pool).await
    }

    fn begin_drain(&self) {
        self.manager.begin_drain();
    }

    async fn close(&self, drain_timeout: Duration) -> Result<CloseOutcome> {
        self.manager.close(drain_timeout).await
    }

    async fn health_check(&self) -> Result<HealthCheckResult> {
        self.manager.health_check().await
    }
}

/// Health of one resource, as seen by [`LifecycleCoordinator::health`].
#[derive(Debug, Clone)]
pub struct ResourceHealth {
    /// Resource name.
    pub resource: String,
    /// Manager state when the check ran.
    pub state: LifecycleState,
    /// Whether the check succeeded.
    pub healthy: bool,
    /// Check latency, when the check reached a connection.
    pub latency: Option<Duration>,
    /// Failure description for an unhealthy resource.
    pub error: Option<String>,
}

/// Aggregated health of every registered resource.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Process-wide state when the report was taken.
    pub state: LifecycleState,
    /// One entry per resource, in registration order.
    pub resources: Vec<ResourceHealth>,
}

impl HealthReport {
    /// Healthy only if every resource is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.resources.iter().all(|r| r.healthy)
    }

    /// Resources whose check failed.
    pub fn unhealthy(&self) -> impl Iterator<Item = &ResourceHealth> {
        self.resources.iter().filter(|r| !r.healthy)
    }
}

/// Result of a completed [`LifecycleCoordinator::stop_all`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Close outcome per resource, in the order the resources were closed.
    pub outcomes: Vec<(String, CloseOutcome)>,
}

impl ShutdownReport {
    /// Whether any resource was closed with handles still outstanding.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_forced())
    }

    /// Outcome for `resource`, if it was closed.
    #[must_use]
    pub fn outcome(&self, resource: &str) -> Option<CloseOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == resource)
            .map(|(_, outcome)| *outcome)
    }
}

/// Starts and stops every resource of the process.
///
/// ```rust,ignore
/// let coordinator = LifecycleCoordinator::new();
/// let db = coordinator.register("postgres", PostgresFactory, db_config)?;
/// let cache = coordinator.register("redis", RedisFactory, cache_config)?;
///
/// coordinator.start_all().await?;
/// // serve requests with `db` and `cache` ...
/// coordinator.stop_all(Duration::from_secs(30)).await?;
/// ```
pub struct LifecycleCoordinator {
    state: Arc<Mutex<LifecycleState>>,
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
    unwind_timeout: Duration,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("state", &self.state())
            .field("resources", &self.resource_names())
            .field("unwind_timeout", &self.unwind_timeout)
            .finish()
    }
}

impl LifecycleCoordinator {
    /// Create a coordinator with no resources.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::Uninitialized)),
            resources: Mutex::new(Vec::new()),
            unwind_timeout: DEFAULT_UNWIND_TIMEOUT,
        }
    }

    /// Bound the time spent closing resources after a failed startup.
    #[must_use]
    pub fn with_unwind_timeout(mut self, timeout: Duration) -> Self {
        self.unwind_timeout = timeout;
        self
    }

    /// Process-wide lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Whether every resource is ready to issue handles.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().accepts_acquisitions()
    }

    /// Registered resource names, in start order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        self.resources
            .lock()
            .iter()
            .map(|r| r.name().to_owned())
            .collect()
    }

    /// Register a resource type and return its manager.
    ///
    /// Registration order is start order. The manager stays uninitialized
    /// until [`start_all`](Self::start_all) runs, and issues no handle until
    /// every registered resource has started.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] once startup has begun.
    /// - [`Error::Config`] if `name` is already registered.
    pub fn register<F: ConnectionFactory>(
        &self,
        name: impl Into<String>,
        factory: F,
        config: impl Into<Arc<ResourceConfig>>,
    ) -> Result<ResourceManager<F::Connector>> {
        let name = name.into();
        let state = self.state.lock();
        if *state != LifecycleState::Uninitialized {
            return Err(Error::InvalidTransition {
                from: *state,
                to: LifecycleState::Starting,
            });
        }

        let mut resources = self.resources.lock();
        if resources.iter().any(|r| r.name() == name) {
            return Err(Error::Config(format!("resource '{name}' is already registered")));
        }

        let backend = factory.kind();
        let manager =
            ResourceManager::with_process_state(name.clone(), config.into(), Arc::clone(&self.state));
        resources.push(Arc::new(Registration {
            factory,
            manager: manager.clone(),
        }));
        tracing::debug!(resource = %name, backend, "resource registered");
        Ok(manager)
    }

    /// Start every registered resource, in registration order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] if startup already ran or is running.
    /// - [`Error::Startup`] if any resource failed. Every resource has been
    ///   closed again and the coordinator is stopped.
    pub async fn start_all(&self) -> Result<()> {
        self.transition(LifecycleState::Uninitialized, LifecycleState::Starting)?;

        let resources = self.snapshot();
        tracing::info!(count = resources.len(), "starting resources");

        for resource in &resources {
            let started = Instant::now();
            match resource.start().await {
                Ok(()) => {
                    tracing::info!(
                        resource = %resource.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "resource started"
                    );
                }
                Err(e) => {
                    tracing::error!(resource = %resource.name(), error = %e, "resource failed to start");
                    let failed = resource.name().to_owned();
                    let unwind = self.unwind(&resources).await;
                    return Err(Error::Startup {
                        resource: failed,
                        source: Box::new(e),
                        unwind,
                    });
                }
            }
        }

        self.transition(LifecycleState::Starting, LifecycleState::Ready)?;
        tracing::info!("all resources ready");
        Ok(())
    }

    /// Stop every resource.
    ///
    /// Every resource stops issuing handles at once; then each is drained
    /// and closed in reverse registration order. `drain_timeout` bounds the
    /// whole shutdown, not each resource.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTransition`] if shutdown already ran, is running,
    ///   or startup is still in progress.
    /// - [`Error::Shutdown`] with every failure if any resource failed to
    ///   close. The remaining resources are still closed.
    pub async fn stop_all(&self, drain_timeout: Duration) -> Result<ShutdownReport> {
        {
            let mut state = self.state.lock();
            if !matches!(
                *state,
                LifecycleState::Ready | LifecycleState::Uninitialized
            ) {
                return Err(Error::InvalidTransition {
                    from: *state,
                    to: LifecycleState::Draining,
                });
            }
            *state = LifecycleState::Draining;
        }

        let resources = self.snapshot();
        tracing::info!(
            count = resources.len(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "stopping resources"
        );
        for resource in &resources {
            resource.begin_drain();
        }

        let deadline = Instant::now() + drain_timeout;
        let mut report = ShutdownReport::default();
        let mut failures = Vec::new();
        for resource in resources.iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match resource.close(remaining).await {
                Ok(outcome) => report.outcomes.push((resource.name().to_owned(), outcome)),
                Err(e) => {
                    tracing::error!(resource = %resource.name(), error = %e, "resource failed to stop");
                    failures.push(ResourceFailure::new(resource.name(), e));
                }
            }
        }

        *self.state.lock() = LifecycleState::Stopped;

        if !failures.is_empty() {
            return Err(Error::Shutdown { failures });
        }
        if report.is_forced() {
            tracing::warn!("shutdown completed with outstanding handles");
        } else {
            tracing::info!("all resources stopped");
        }
        Ok(report)
    }

    /// Health-check every resource concurrently.
    ///
    /// The result is advisory; it never changes any state.
    pub async fn health(&self) -> HealthReport {
        let state = self.state();
        let resources = self.snapshot();
        let checks = resources.iter().map(|resource| async move {
            let state = resource.state();
            match resource.health_check().await {
                Ok(result) => ResourceHealth {
                    resource: resource.name().to_owned(),
                    state,
                    healthy: result.healthy,
                    latency: Some(result.latency),
                    error: result.error,
                },
                Err(e) => ResourceHealth {
                    resource: resource.name().to_owned(),
                    state,
                    healthy: false,
                    latency: None,
                    error: Some(e.to_string()),
                },
            }
        });

        HealthReport {
            state,
            resources: join_all(checks).await,
        }
    }

    /// Close every resource after a failed startup, in reverse order.
    async fn unwind(&self, resources: &[Arc<dyn ManagedResource>]) -> Vec<ResourceFailure> {
        {
            let mut state = self.state.lock();
            *state = LifecycleState::Draining;
        }
        for resource in resources {
            resource.begin_drain();
        }

        let deadline = Instant::now() + self.unwind_timeout;
        let mut failures = Vec::new();
        for resource in resources.iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match resource.close(remaining).await {
                Ok(outcome) if outcome.is_forced() => {
                    tracing::warn!(resource = %resource.name(), "unwind closed resource with outstanding handles");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(resource = %resource.name(), error = %e, "error while unwinding startup");
                    failures.push(ResourceFailure::new(resource.name(), e));
                }
            }
        }

        *self.state.lock() = LifecycleState::Stopped;
        failures
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::InvalidTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedResource>> {
        self.resources.lock().clone()
    }
}
