//! Request-scoped handles.

use std::fmt;
use std::sync::Arc;

use lifespan_pool::{Connector, PooledConnection};

use crate::error::{Error, Result};
use crate::manager::Shared;

/// A request-scoped lease on one pooled connection.
///
/// A handle is released exactly once: explicitly through
/// [`release`](Self::release), or implicitly when it is dropped while still
/// active. Prefer [`with_handle`](crate::with_handle), which makes the
/// release structural.
///
/// If the manager is force-closed while the handle is out, the handle is
/// invalidated: its connection can no longer be borrowed and is closed as
/// soon as the handle is touched, released or dropped.
pub struct Handle<K: Connector> {
    shared: Arc<Shared<K>>,
    conn: Option<PooledConnection<K>>,
    connection_id: u64,
    active: bool,
}

impl<K: Connector> Handle<K> {
    pub(crate) fn new(shared: Arc<Shared<K>>, conn: PooledConnection<K>) -> Self {
        let connection_id = conn.metadata().id;
        Self {
            shared,
            conn: Some(conn),
            connection_id,
            active: true,
        }
    }

    /// Name of the resource this handle was borrowed from.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.shared.name
    }

    /// Id of the pooled connection this handle leases.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the handle still holds a usable connection.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active && !self.shared.is_forced()
    }

    /// Borrow the underlying connection.
    ///
    /// # Errors
    ///
    /// - [`Error::HandleReleased`] once the handle has been released.
    /// - [`Error::HandleInvalidated`] once the manager was force-closed.
    pub fn connection(&self) -> Result<&K::Connection> {
        if self.shared.is_forced() {
            return Err(self.invalidated());
        }
        self.conn.as_deref().ok_or(Error::HandleReleased)
    }

    /// Mutably borrow the underlying connection.
    ///
    /// After a forced close this also gives the connection up, which closes
    /// it through the connector.
    ///
    /// # Errors
    ///
    /// - [`Error::HandleReleased`] once the handle has been released.
    /// - [`Error::HandleInvalidated`] once the manager was force-closed.
    pub fn connection_mut(&mut self) -> Result<&mut K::Connection> {
        if self.shared.is_forced() {
            drop(self.conn.take());
            return Err(self.invalidated());
        }
        self.conn.as_deref_mut().ok_or(Error::HandleReleased)
    }

    /// Whether this handle was issued by the manager owning `shared`.
    pub(crate) fn is_issued_by(&self, shared: &Arc<Shared<K>>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    /// Discard the connection instead of reusing it when it goes back, or
    /// undo that.
    pub(crate) fn set_discard(&mut self, discard: bool) {
        if let Some(conn) = self.conn.as_mut() {
            if discard {
                conn.discard();
            } else {
                conn.restore();
            }
        }
    }

    fn invalidated(&self) -> Error {
        Error::HandleInvalidated {
            resource: self.shared.name.clone(),
        }
    }

    /// Return the connection to its pool.
    ///
    /// The first call releases; later calls fail with
    /// [`Error::DoubleRelease`], which is logged as a bug. If the manager
    /// was force-closed, releasing always succeeds: the pool is gone and the
    /// connection is closed through the connector.
    ///
    /// # Errors
    ///
    /// [`Error::DoubleRelease`] on a second release.
    pub fn release(&mut self) -> Result<()> {
        if !self.active {
            if self.shared.is_forced() {
                return Ok(());
            }
            tracing::error!(
                resource = %self.shared.name,
                connection_id = self.connection_id,
                "handle released more than once"
            );
            return Err(Error::DoubleRelease {
                resource: self.shared.name.clone(),
                connection_id: self.connection_id,
            });
        }

        self.active = false;
        // Back to the pool before the count drops, so a drain that completes
        // on this release sees the connection idle and closes it properly.
        drop(self.conn.take());
        self.shared.leave();
        tracing::trace!(
            resource = %self.shared.name,
            connection_id = self.connection_id,
            "handle released"
        );
        Ok(())
    }
}

impl<K: Connector> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("resource", &self.shared.name)
            .field("connection_id", &self.connection_id)
            .field("active", &self.active)
            .finish()
    }
}

impl<K: Connector> Drop for Handle<K> {
    fn drop(&mut self) {
        if self.active {
            // Releasing an active handle cannot fail.
            let _ = self.release();
        }
    }
}
