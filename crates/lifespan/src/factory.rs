//! Connection factories.
//!
//! A [`ConnectionFactory`] turns a [`ResourceConfig`] into the
//! [`Connector`] for one backend; [`build`] validates the configuration and
//! constructs the pool, opening at least one live connection so that an
//! unreachable backend is reported immediately.

use lifespan_pool::{Connector, Pool, PoolError};

use crate::config::ResourceConfig;
use crate::error::{Error, Result};

/// Builds the connector for one kind of backend.
///
/// Implementations are plain values with no side effects; all I/O happens in
/// [`build`]. Calling [`build`] twice with the same configuration produces
/// two independent pools, so singleton enforcement is the caller's job (the
/// [`LifecycleCoordinator`](crate::LifecycleCoordinator) does it).
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connector type produced by this factory.
    type Connector: Connector;

    /// Short backend name used in logs and errors, e.g. `"postgres"`.
    fn kind(&self) -> &'static str;

    /// Liveness check used when the configuration does not name one.
    fn default_health_check(&self) -> &'static str;

    /// Create a connector for `config`.
    ///
    /// Must not perform I/O. Fails with [`Error::Config`] when the
    /// connection string cannot be used by this backend.
    fn connector(&self, config: &ResourceConfig) -> Result<Self::Connector>;
}

/// Validate `config` and build a pool for it.
///
/// Each initial connection attempt is bounded by the configured acquire
/// timeout. If one times out, the connections opened before it are closed.
///
/// # Errors
///
/// - [`Error::Config`] if the configuration is invalid.
/// - [`Error::Connect`] if no connection could be established.
pub async fn build<F: ConnectionFactory>(
    factory: &F,
    config: &ResourceConfig,
) -> Result<Pool<F::Connector>> {
    config.validate()?;
    let connector = factory.connector(config)?;
    let pool_config = config.pool_config(factory.default_health_check());

    tracing::debug!(
        backend = factory.kind(),
        dsn = %config.redacted_connection_string(),
        min = config.min_pool_size,
        max = config.max_pool_size,
        "building connection pool"
    );

    Pool::new(connector, pool_config).await.map_err(|e| match e {
        PoolError::Configuration(message) => Error::Config(message),
        other => Error::Connect {
            resource: factory.kind().to_owned(),
            message: other.to_string(),
        },
    })
}
