//! Scoped acquisition.
//!
//! [`with_handle`] is the sanctioned way for request code to use a
//! resource: acquire, run the caller's unit of work, release on every exit
//! path. Release happens when the body returns, when it fails, when the
//! request token cancels it, and when the enclosing future is dropped
//! mid-flight (the handle's `Drop` covers that last case).

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use lifespan_pool::Connector;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::handle::Handle;
use crate::manager::{AcquireOptions, ResourceManager};

/// Acquire a handle from `manager`, run `body` with it and release it.
///
/// If acquisition fails, `body` is never invoked and the error is returned
/// unchanged. If `options` carries a cancellation token and it fires while
/// `body` runs, `body` is dropped and [`Error::Cancelled`] is returned.
///
/// ```rust,ignore
/// let name: String = with_handle(&db, AcquireOptions::new(), |handle| {
///     Box::pin(async move {
///         let conn = handle.connection_mut()?;
///         fetch_name(conn).await
///     })
/// })
/// .await?;
/// ```
pub async fn with_handle<K, T, E, F>(
    manager: &ResourceManager<K>,
    options: AcquireOptions,
    body: F,
) -> Result<T, E>
where
    K: Connector,
    E: From<Error>,
    F: for<'h> FnOnce(&'h mut Handle<K>) -> BoxFuture<'h, Result<T, E>>,
{
    let cancel = options.cancel.clone();
    let mut handle = manager.acquire(options).await?;

    let outcome = until_cancelled(manager.name(), cancel.as_ref(), body(&mut handle)).await;

    // The body may already have released the handle itself.
    if handle.is_active() {
        handle.release()?;
    }
    outcome
}

/// Run `work` to completion, or until `cancel` fires.
pub(crate) async fn until_cancelled<T, E, W>(
    resource: &str,
    cancel: Option<&CancellationToken>,
    work: W,
) -> Result<T, E>
where
    E: From<Error>,
    W: Future<Output = Result<T, E>>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::debug!(resource, "request cancelled while holding handle");
                    Err(E::from(Error::Cancelled))
                }
                result = work => result,
            }
        }
        None => work.await,
    }
}

/// Per-request entry point to one resource.
///
/// The routing layer keeps one provider per resource type and derives a
/// request-bound copy with [`for_request`](Self::for_request), so handler
/// code obtains handles without passing any arguments at the call site.
pub struct HandleProvider<K: Connector> {
    manager: ResourceManager<K>,
    options: AcquireOptions,
}

impl<K: Connector> Clone for HandleProvider<K> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            options: self.options.clone(),
        }
    }
}

impl<K: Connector> std::fmt::Debug for HandleProvider<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleProvider")
            .field("resource", &self.manager.name())
            .field("options", &self.options)
            .finish()
    }
}

impl<K: Connector> HandleProvider<K> {
    /// Create a provider for `manager`.
    #[must_use]
    pub fn new(manager: ResourceManager<K>) -> Self {
        Self {
            manager,
            options: AcquireOptions::default(),
        }
    }

    /// A copy bound to one request's cancellation token.
    #[must_use]
    pub fn for_request(&self, cancel: CancellationToken) -> Self {
        Self {
            manager: self.manager.clone(),
            options: self.options.clone().cancel_token(cancel),
        }
    }

    /// Override the acquisition timeout for handles from this provider.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// The manager behind this provider.
    #[must_use]
    pub fn manager(&self) -> &ResourceManager<K> {
        &self.manager
    }

    /// Run `body` with a handle; see [`with_handle`].
    pub async fn with_handle<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<Error>,
        F: for<'h> FnOnce(&'h mut Handle<K>) -> BoxFuture<'h, Result<T, E>>,
    {
        with_handle(&self.manager, self.options.clone(), body).await
    }

    /// Acquire a handle for the rest of the request.
    ///
    /// The handle releases itself when dropped at the end of the request.
    pub async fn handle(&self) -> crate::Result<Handle<K>> {
        self.manager.acquire(self.options.clone()).await
    }
}
