//! Runtime destination.
//!
//! # Responsibilities
//! - Hold the current [`DestinationConfig`] behind a swappable reference
//! - Track composite health (active + passive)
//! - Track in-flight requests for load balancing
//! - Carry per-destination bookkeeping for the health policies

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use url::Url;

use crate::config::schema::Destination;
use crate::health::passive::PassiveHealthTracker;
use crate::health::state::{AtomicCompositeHealth, CompositeHealth, DestinationHealth};

/// Validated destination content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    /// Base address requests are forwarded to.
    pub address: Url,
    /// Probe address, when different from `address`.
    pub health_address: Option<Url>,
    pub metadata: BTreeMap<String, String>,
}

impl DestinationConfig {
    pub fn from_options(options: &Destination) -> Result<Self, url::ParseError> {
        Ok(Self {
            address: Url::parse(&options.address)?,
            health_address: options.health.as_deref().map(Url::parse).transpose()?,
            metadata: options.metadata.clone(),
        })
    }

    /// Address active probes are sent to.
    pub fn probe_base(&self) -> &Url {
        self.health_address.as_ref().unwrap_or(&self.address)
    }
}

/// A single backend endpoint inside a cluster.
#[derive(Debug)]
pub struct DestinationInfo {
    id: String,
    config: ArcSwap<DestinationConfig>,
    health: AtomicCompositeHealth,
    concurrent_requests: AtomicUsize,

    /// Passive policy bookkeeping.
    pub(crate) passive: PassiveHealthTracker,

    /// Consecutive failed probes, used by the active consecutive-failures policy.
    pub(crate) active_failures: AtomicUsize,
}

impl DestinationInfo {
    pub fn new(id: impl Into<String>, config: DestinationConfig) -> Self {
        Self {
            id: id.into(),
            config: ArcSwap::from_pointee(config),
            health: AtomicCompositeHealth::default(),
            concurrent_requests: AtomicUsize::new(0),
            passive: PassiveHealthTracker::default(),
            active_failures: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> Arc<DestinationConfig> {
        self.config.load_full()
    }

    /// Swap in new content. Returns false when nothing changed.
    pub fn update_config(&self, config: DestinationConfig) -> bool {
        if **self.config.load() == config {
            return false;
        }
        self.config.store(Arc::new(config));
        true
    }

    pub fn health(&self) -> CompositeHealth {
        self.health.load()
    }

    pub(crate) fn set_active_health(&self, health: DestinationHealth) -> bool {
        self.health.set_active(health)
    }

    pub(crate) fn set_passive_health(&self, health: DestinationHealth) -> bool {
        self.health.set_passive(health)
    }

    /// Requests currently in flight to this destination.
    pub fn concurrent_requests(&self) -> usize {
        self.concurrent_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_requests(&self) {
        self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_requests(&self) {
        self.concurrent_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
