//! Config filter hooks.
//!
//! Filters run in registration order against every cluster and route of a
//! pass. They may rewrite fields or reject the resource. A failing filter,
//! whether it returns an error or panics, only takes down the resource it was
//! invoked for.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::config::schema::{Cluster, ProxyRoute};

/// Error returned by a filter to reject a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FilterError(pub String);

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A hook invoked for every cluster and route during reconciliation.
pub trait ProxyConfigFilter: Send + Sync {
    /// Inspect or rewrite a cluster before validation.
    fn configure_cluster(&self, _cluster: &mut Cluster) -> Result<(), FilterError> {
        Ok(())
    }

    /// Inspect or rewrite a route before parsing.
    fn configure_route(&self, _route: &mut ProxyRoute) -> Result<(), FilterError> {
        Ok(())
    }
}

/// Run one filter invocation, converting a panic into an error message.
pub(crate) fn run_isolated<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), FilterError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("filter panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
