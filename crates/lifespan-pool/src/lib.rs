//! # lifespan-pool
//!
//! Bounded async connection pool with pluggable backends.
//!
//! The pool knows nothing about the wire protocol of the connections it
//! holds. A [`Connector`] opens, checks and closes connections; the pool
//! bounds how many exist, reuses idle ones and hands them out as
//! [`PooledConnection`]s that return themselves on drop.
//!
//! ## Features
//!
//! - Configurable min/max pool sizes
//! - Fail-fast construction: the initial connections are opened up front
//! - Acquisition timeout, idle timeout and maximum lifetime
//! - Health checks via a configurable query or command
//! - Idempotent close that wakes every waiter
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifespan_pool::{PoolBuilder, PoolConfig};
//!
//! let pool = PoolBuilder::new()
//!     .min_connections(2)
//!     .max_connections(20)
//!     .connection_timeout(Duration::from_secs(5))
//!     .build(connector)
//!     .await?;
//!
//! let conn = pool.get().await?;
//! // Use connection...
//! // Connection automatically returned to pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

pub use config::PoolConfig;
pub use error::PoolError;
pub use lifecycle::{ConnectionMetadata, ConnectionState, Connector, HealthCheckResult};
pub use pool::{Pool, PoolBuilder, PoolStatus, PooledConnection};
