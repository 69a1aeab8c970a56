//! Runtime cluster.
//!
//! # Responsibilities
//! - Hold the current [`ClusterConfig`] behind a swappable reference
//! - Own the cluster's destinations
//! - Publish the all/healthy destination lists as one atomic unit
//! - Track in-flight requests and the round-robin cursor
//!
//! # Design Decisions
//! - Recomputing the dynamic state serializes on a per-cluster mutex; readers
//!   only ever load the published `Arc`
//! - The revision counter moves on config swaps and membership changes so
//!   routes can detect stale derived data without deep comparison

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::schema::{Cluster, HealthSettings};
use crate::runtime::destination::DestinationInfo;
use crate::runtime::manager::ItemManager;

/// Validated cluster content plus values resolved against process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub options: Arc<Cluster>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_path: String,
    pub reactivation_period: Duration,
    /// Per-cluster request timeout override.
    pub request_timeout: Option<Duration>,
}

impl ClusterConfig {
    pub fn new(options: Arc<Cluster>, defaults: &HealthSettings) -> Self {
        let active = &options.health_check.active;
        let passive = &options.health_check.passive;
        Self {
            probe_interval: Duration::from_millis(active.interval_ms.unwrap_or(defaults.default_probe_interval_ms)),
            probe_timeout: Duration::from_millis(active.timeout_ms.unwrap_or(defaults.default_probe_timeout_ms)),
            probe_path: active
                .path
                .clone()
                .unwrap_or_else(|| defaults.default_probe_path.clone()),
            reactivation_period: Duration::from_millis(
                passive
                    .reactivation_period_ms
                    .unwrap_or(defaults.default_reactivation_period_ms),
            ),
            request_timeout: options.http_request.timeout_ms.map(Duration::from_millis),
            options,
        }
    }

    pub fn active_enabled(&self) -> bool {
        self.options.health_check.active.enabled
    }

    pub fn passive_enabled(&self) -> bool {
        self.options.health_check.passive.enabled
    }
}

/// Destination lists published together.
#[derive(Debug, Default)]
pub struct ClusterDynamicState {
    /// Every destination, in insertion order.
    pub all_destinations: Vec<Arc<DestinationInfo>>,
    /// Destinations passing the eligibility rule.
    pub healthy_destinations: Vec<Arc<DestinationInfo>>,
}

/// A long-lived cluster object. Identity is stable across reconciliation passes.
#[derive(Debug)]
pub struct ClusterInfo {
    id: String,
    config: ArcSwap<ClusterConfig>,
    destinations: ItemManager<DestinationInfo>,
    dynamic_state: ArcSwap<ClusterDynamicState>,
    concurrent_requests: AtomicUsize,
    revision: AtomicU64,
    round_robin: AtomicUsize,
    state_lock: Mutex<()>,
}

impl ClusterInfo {
    pub fn new(id: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            id: id.into(),
            config: ArcSwap::from_pointee(config),
            destinations: ItemManager::new(),
            dynamic_state: ArcSwap::from_pointee(ClusterDynamicState::default()),
            concurrent_requests: AtomicUsize::new(0),
            revision: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
            state_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> Arc<ClusterConfig> {
        self.config.load_full()
    }

    /// Swap in new content. Returns false when nothing changed.
    pub fn update_config(&self, config: ClusterConfig) -> bool {
        if **self.config.load() == config {
            return false;
        }
        self.config.store(Arc::new(config));
        self.bump_revision();
        true
    }

    pub fn destinations(&self) -> &ItemManager<DestinationInfo> {
        &self.destinations
    }

    pub fn dynamic_state(&self) -> Arc<ClusterDynamicState> {
        self.dynamic_state.load_full()
    }

    /// Rebuild both destination lists from current membership and health,
    /// then publish them with a single store.
    pub fn update_dynamic_state(&self) {
        let _guard = self.state_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let config = self.config.load();
        let (active_enabled, passive_enabled) = (config.active_enabled(), config.passive_enabled());

        let all_destinations: Vec<_> = self.destinations.items().iter().cloned().collect();
        let healthy_destinations = all_destinations
            .iter()
            .filter(|d| d.health().is_eligible(active_enabled, passive_enabled))
            .cloned()
            .collect();

        self.dynamic_state.store(Arc::new(ClusterDynamicState {
            all_destinations,
            healthy_destinations,
        }));
    }

    /// Requests currently in flight to this cluster.
    pub fn concurrent_requests(&self) -> usize {
        self.concurrent_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_requests(&self) {
        self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_requests(&self) {
        self.concurrent_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Next value of the round-robin cursor.
    pub(crate) fn next_round_robin(&self) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }
}
