//! Upstream HTTP client seam.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

/// Transport failure talking to a destination.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ForwardError {
    pub message: String,
    /// The connection was never established.
    pub connect: bool,
}

impl ForwardError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connect: false,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connect: true,
        }
    }
}

/// Sends a prepared request to a destination and returns its response head
/// with a streaming body.
#[async_trait]
pub trait HttpForwarder: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ForwardError>;
}

/// Forwarder on the hyper-util pooled client.
#[derive(Clone)]
pub struct HyperForwarder {
    client: Client<HttpConnector, Body>,
}

impl HyperForwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

impl Default for HyperForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpForwarder for HyperForwarder {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        match self.client.request(request).await {
            Ok(response) => Ok(response.map(Body::new)),
            Err(e) if e.is_connect() => Err(ForwardError::connect(e.to_string())),
            Err(e) => Err(ForwardError::new(e.to_string())),
        }
    }
}
