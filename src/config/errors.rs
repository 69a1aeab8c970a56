//! Per-resource configuration errors.
//!
//! Validation failures are soft: the offending resource is dropped and the
//! error is collected, the reconciliation pass carries on.

use std::fmt;

use thiserror::Error;

/// Kind of resource an error is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Route,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cluster => write!(f, "cluster"),
            ResourceKind::Route => write!(f, "route"),
        }
    }
}

/// Machine readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigErrorCode {
    ClusterIdMismatch,
    ClusterFilterFailed,
    InvalidDestinationAddress,
    UnknownLoadBalancingMode,
    UnknownActiveHealthPolicy,
    UnknownPassiveHealthPolicy,
    NoSessionAffinityProviderFound,
    NoAffinityFailurePolicyFound,
    DuplicateRouteId,
    RouteFilterFailed,
    RouteMissingId,
    RouteHasNoMatchers,
    RouteInvalidMatcher,
    RouteInvalidAuthorizationPolicy,
    RouteInvalidCorsPolicy,
    RouteInvalidTransform,
}

/// A single soft validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} '{id}': {message}")]
pub struct ConfigValidationError {
    pub kind: ResourceKind,
    pub id: String,
    pub code: ConfigErrorCode,
    pub message: String,
}

impl ConfigValidationError {
    pub fn cluster(id: impl Into<String>, code: ConfigErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Cluster,
            id: id.into(),
            code,
            message: message.into(),
        }
    }

    pub fn route(id: impl Into<String>, code: ConfigErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Route,
            id: id.into(),
            code,
            message: message.into(),
        }
    }
}

/// Collects errors reported during one pass.
#[derive(Debug, Default)]
pub struct ConfigErrors {
    errors: Vec<ConfigValidationError>,
}

impl ConfigErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log an error.
    pub fn report(&mut self, error: ConfigValidationError) {
        tracing::error!(
            kind = %error.kind,
            id = %error.id,
            code = ?error.code,
            "{}",
            error.message
        );
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigValidationError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<ConfigValidationError> {
        self.errors
    }
}
