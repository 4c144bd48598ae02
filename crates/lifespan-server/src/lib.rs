//! # lifespan-server
//!
//! Process entry point for a service backed by one PostgreSQL pool and one
//! Redis pool.
//!
//! The binary loads [`Settings`] from the environment (and an optional
//! `.env` file), starts both resources
//! through a [`LifecycleCoordinator`](lifespan::LifecycleCoordinator) before
//! anything else, reports health periodically, and drains both pools when a
//! termination signal arrives.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod settings;
pub mod signal;

pub use settings::{Environment, Settings, SettingsError, load_dotenv, load_dotenv_from};
