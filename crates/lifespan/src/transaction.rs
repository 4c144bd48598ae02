//! Transactional scopes.
//!
//! [`with_transaction`] is [`with_handle`](crate::with_handle) for backends
//! with transactions: the body runs between `BEGIN` and `COMMIT`, and any
//! failure rolls the work back. A transaction that is interrupted before it
//! commits or rolls back (the request is cancelled, the future is dropped,
//! or the rollback itself fails) leaves the session in an unknown state, so
//! its connection is closed instead of going back to the pool.

use std::fmt;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lifespan_pool::Connector;

use crate::error::Error;
use crate::handle::Handle;
use crate::manager::{AcquireOptions, ResourceManager};
use crate::scope::until_cancelled;

/// A connection that supports transactions.
#[async_trait]
pub trait Transactional: Send {
    /// Driver error.
    type Error: fmt::Display + Send;

    /// Start a transaction.
    async fn begin(&mut self) -> Result<(), Self::Error>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), Self::Error>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// Acquire a connection from `manager` and run `body` inside a transaction.
///
/// The transaction commits when `body` returns `Ok` and rolls back when it
/// returns `Err`; the body's error is returned unchanged. A failed `BEGIN`
/// or `COMMIT` is reported as [`Error::Transaction`]. Cancellation through
/// the token in `options` behaves as in [`with_handle`](crate::with_handle).
///
/// ```rust,ignore
/// let id: i64 = with_transaction(&db, AcquireOptions::new(), |conn| {
///     Box::pin(async move {
///         let id = insert_order(conn, &order).await?;
///         insert_lines(conn, id, &order.lines).await?;
///         Ok(id)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<K, T, E, F>(
    manager: &ResourceManager<K>,
    options: AcquireOptions,
    body: F,
) -> Result<T, E>
where
    K: Connector,
    K::Connection: Transactional,
    E: From<Error>,
    F: for<'c> FnOnce(&'c mut K::Connection) -> BoxFuture<'c, Result<T, E>>,
{
    let cancel = options.cancel.clone();
    let mut handle = manager.acquire(options).await?;

    let outcome = until_cancelled(
        manager.name(),
        cancel.as_ref(),
        run_transaction(&mut handle, body),
    )
    .await;

    if handle.is_active() {
        handle.release()?;
    }
    outcome
}

async fn run_transaction<K, T, E, F>(handle: &mut Handle<K>, body: F) -> Result<T, E>
where
    K: Connector,
    K::Connection: Transactional,
    E: From<Error>,
    F: for<'c> FnOnce(&'c mut K::Connection) -> BoxFuture<'c, Result<T, E>>,
{
    let resource = handle.resource().to_owned();
    // Cleared only once the transaction has ended cleanly.
    handle.set_discard(true);

    let conn = handle.connection_mut()?;
    conn.begin()
        .await
        .map_err(|e| transaction_error(&resource, "begin", &e))?;

    let outcome = body(&mut *conn).await;
    match outcome {
        Ok(value) => {
            conn.commit()
                .await
                .map_err(|e| transaction_error(&resource, "commit", &e))?;
            handle.set_discard(false);
            tracing::trace!(resource = %resource, "transaction committed");
            Ok(value)
        }
        Err(e) => {
            match conn.rollback().await {
                Ok(()) => {
                    handle.set_discard(false);
                    tracing::debug!(resource = %resource, "transaction rolled back");
                }
                Err(rollback) => {
                    tracing::warn!(
                        resource = %resource,
                        error = %rollback,
                        "rollback failed, closing connection"
                    );
                }
            }
            Err(e)
        }
    }
}

fn transaction_error(resource: &str, stage: &str, error: &dyn fmt::Display) -> Error {
    tracing::warn!(resource, stage, error = %error, "transaction failed, closing connection");
    Error::Transaction {
        resource: resource.to_owned(),
        message: format!("{stage}: {error}"),
    }
}
