//! Proxy error taxonomy.
//!
//! Every failure on the request path maps to one [`ProxyErrorKind`], which
//! fixes the status returned to the caller and whether the destination is
//! blamed for it.

use std::fmt;

use axum::http::StatusCode;
use thiserror::Error;

/// Request-time selection failure. Fatal for the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Load balancing mode '{0}' is not supported.")]
    UnsupportedLoadBalancingMode(String),

    #[error("No session affinity provider is registered for mode '{0}'.")]
    UnknownAffinityProvider(String),

    #[error("No affinity failure policy is registered for '{0}'.")]
    UnknownAffinityFailurePolicy(String),
}

/// Category of a failed proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyErrorKind {
    /// The cluster has no eligible destination, or the route has no cluster.
    NoAvailableDestinations,
    /// The affinity failure policy stopped the request.
    AffinityAborted,
    /// Load balancing or affinity lookup failed with a [`SelectionError`].
    Selection,
    /// The upstream request could not be built.
    RequestConstruction,
    /// No response headers within the request timeout.
    RequestTimeout,
    /// Connecting or talking to the destination failed.
    UpstreamTransport,
    /// Reading the client's request body failed.
    RequestBodyClient,
    /// Writing the request body to the destination failed.
    RequestBodyDestination,
    /// A response transform failed.
    ResponseTransform,
    /// Reading the destination's response body failed.
    ResponseBodyDestination,
    /// Writing the response body to the client failed.
    ResponseBodyClient,
    /// The caller cancelled the request.
    RequestCanceled,
}

impl ProxyErrorKind {
    /// Status returned to the caller when headers have not been sent yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorKind::NoAvailableDestinations | ProxyErrorKind::AffinityAborted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyErrorKind::Selection | ProxyErrorKind::RequestConstruction => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorKind::RequestBodyClient => StatusCode::BAD_REQUEST,
            ProxyErrorKind::UpstreamTransport
            | ProxyErrorKind::RequestBodyDestination
            | ProxyErrorKind::ResponseTransform
            | ProxyErrorKind::ResponseBodyDestination
            | ProxyErrorKind::ResponseBodyClient
            | ProxyErrorKind::RequestCanceled => StatusCode::BAD_GATEWAY,
        }
    }

    /// True when the failure originated at the destination and should feed
    /// passive health.
    pub fn is_destination_failure(&self) -> bool {
        matches!(
            self,
            ProxyErrorKind::RequestTimeout
                | ProxyErrorKind::UpstreamTransport
                | ProxyErrorKind::RequestBodyDestination
                | ProxyErrorKind::ResponseBodyDestination
        )
    }
}

impl fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed proxied call with its originating cause.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ProxyErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }
}

impl From<SelectionError> for ProxyError {
    fn from(e: SelectionError) -> Self {
        ProxyError::with_source(ProxyErrorKind::Selection, "destination selection failed", e)
    }
}
