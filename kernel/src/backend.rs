use std::{net::Ipv4Addr, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{object::Object, Result};

/// Access to the packet filter, the routing subsystem and the route-table
/// registry of the node.
///
/// Implementations report "already present" and "already absent" through
/// [`Backend::exists`]; `create` and `remove` are only called after such a
/// check and may treat a lost race the same way.
pub trait Backend: Send + Sync {
    fn exists(&self, object: &Object) -> Result<bool>;

    fn create(&self, object: &Object) -> Result<()>;

    fn remove(&self, object: &Object) -> Result<()>;

    fn flush_route_cache(&self) -> Result<()>;

    fn link_exists(&self, name: &str) -> Result<bool>;

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn exists(&self, object: &Object) -> Result<bool> {
        (**self).exists(object)
    }

    fn create(&self, object: &Object) -> Result<()> {
        (**self).create(object)
    }

    fn remove(&self, object: &Object) -> Result<()> {
        (**self).remove(object)
    }

    fn flush_route_cache(&self) -> Result<()> {
        (**self).flush_route_cache()
    }

    fn link_exists(&self, name: &str) -> Result<bool> {
        (**self).link_exists(name)
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        (**self).addresses(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Changed,
    Failed,
}

/// Creates `object` unless it already exists.
///
/// Failures are logged and reported as [`Outcome::Failed`], never returned:
/// one broken object must not stop the rest of a pass.
pub fn ensure_present<B: Backend + ?Sized>(backend: &B, object: &Object) -> Outcome {
    match backend.exists(object) {
        Ok(true) => {
            trace!(%object, "already present");
            Outcome::Unchanged
        }
        Ok(false) => match backend.create(object) {
            Ok(()) => {
                debug!(%object, "created");
                Outcome::Changed
            }
            Err(e) => {
                warn!(%object, error = %e, "failed to create");
                Outcome::Failed
            }
        },
        Err(e) => {
            warn!(%object, error = %e, "failed to look up");
            Outcome::Failed
        }
    }
}

/// Removes `object` if it exists. Failures are handled as in [`ensure_present`].
pub fn ensure_absent<B: Backend + ?Sized>(backend: &B, object: &Object) -> Outcome {
    match backend.exists(object) {
        Ok(false) => {
            trace!(%object, "already absent");
            Outcome::Unchanged
        }
        Ok(true) => match backend.remove(object) {
            Ok(()) => {
                debug!(%object, "removed");
                Outcome::Changed
            }
            Err(e) => {
                warn!(%object, error = %e, "failed to remove");
                Outcome::Failed
            }
        },
        Err(e) => {
            warn!(%object, error = %e, "failed to look up");
            Outcome::Failed
        }
    }
}
