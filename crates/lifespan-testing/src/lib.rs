//! # lifespan-testing
//!
//! Test infrastructure for the lifespan crates.
//!
//! ## Features
//!
//! - [`MockConnector`]: in-memory connections with injectable connect
//!   failures, health check failures and latency; its connections record
//!   transaction boundaries
//! - [`MockFactory`]: a [`ConnectionFactory`](lifespan::ConnectionFactory)
//!   over a shared [`MockConnector`]
//! - [`fixtures`]: ready-made resource configurations
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifespan_testing::{MockFactory, fixtures};
//!
//! #[tokio::test]
//! async fn test_with_mock_backend() {
//!     let factory = MockFactory::new();
//!     let pool = lifespan::build(&factory, &fixtures::resource_config(4)).await.unwrap();
//!     assert_eq!(factory.mock().opened(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_connector;

pub use mock_connector::{MOCK_SCHEME, MockConnection, MockConnector, MockFactory};
