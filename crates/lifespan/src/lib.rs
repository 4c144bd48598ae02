//! # lifespan
//!
//! Process-scoped lifecycle management for pooled database and cache
//! connections.
//!
//! A service owns exactly one connection pool per resource type. This crate
//! builds those pools at startup, hands request code short-lived handles
//! that are always returned, and shuts everything down in a deterministic
//! order.
//!
//! ## Components
//!
//! - [`ConnectionFactory`] / [`build`]: validate a [`ResourceConfig`] and
//!   build a pool with at least one live connection.
//! - [`ResourceManager`]: owns one pool, issues [`Handle`]s only while
//!   ready, drains outstanding handles on close.
//! - [`LifecycleCoordinator`]: starts every manager in order, unwinds on
//!   failure, stops them in reverse order with one shared drain deadline.
//! - [`with_handle`] / [`HandleProvider`]: request-scoped acquisition with
//!   release on every exit path.
//! - [`with_transaction`]: a scoped handle whose work commits on success and
//!   rolls back on failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifespan::{AcquireOptions, LifecycleCoordinator, ResourceConfig};
//! use lifespan::backends::{PostgresFactory, RedisFactory};
//!
//! let coordinator = LifecycleCoordinator::new();
//! let db = coordinator.register("postgres", PostgresFactory, ResourceConfig::new(db_url))?;
//! let cache = coordinator.register("redis", RedisFactory, ResourceConfig::new(cache_url))?;
//! coordinator.start_all().await?;
//!
//! let count = db
//!     .with_handle(AcquireOptions::new(), |handle| {
//!         Box::pin(async move { count_users(handle.connection_mut()?).await })
//!     })
//!     .await?;
//!
//! coordinator.stop_all(Duration::from_secs(30)).await?;
//! ```
//!
//! ## Features
//!
//! - `postgres`: PostgreSQL backend on `sqlx`
//! - `redis`: Redis backend on the `redis` crate

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod backends;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod handle;
pub mod manager;
pub mod scope;
pub mod state;
pub mod transaction;

pub use config::ResourceConfig;
pub use coordinator::{HealthReport, LifecycleCoordinator, ResourceHealth, ShutdownReport};
pub use error::{Error, ResourceFailure, Result};
pub use factory::{ConnectionFactory, build};
pub use handle::Handle;
pub use manager::{AcquireOptions, CloseOutcome, ResourceManager};
pub use scope::{HandleProvider, with_handle};
pub use state::LifecycleState;
pub use transaction::{Transactional, with_transaction};

// Re-export the pool types that appear in this crate's public API.
pub use lifespan_pool::{Connector, HealthCheckResult, Pool, PoolConfig, PoolError, PoolStatus};
