//! Connection factories for concrete backends.
//!
//! Each backend sits behind a cargo feature so that applications only pull
//! in the client libraries they use.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnector, PostgresFactory};
#[cfg(feature = "redis")]
pub use redis::{RedisConnector, RedisFactory};
