//! Reverse proxy control plane and request dispatch core.

pub mod affinity;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod management;
pub mod observability;
pub mod proxy;
pub mod registry;
pub mod runtime;

pub use config::source::ConfigSource;
pub use lifecycle::{ProxyRuntime, Shutdown};
pub use proxy::dispatcher::RequestDispatcher;
