//! Composition root.
//!
//! # Responsibilities
//! - Build the policy registries and the runtime registries
//! - Wire health coordinator, probe worker, config manager and dispatcher
//! - Start the reconciliation loop and stop background work on shutdown
//!
//! # Design Decisions
//! - Every seam (random source, forwarder, probe client, telemetry) can be
//!   swapped before `build`; production defaults are used otherwise
//! - Shutdown is idempotent

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::affinity::SessionAffinity;
use crate::config::builder::DynamicConfigBuilder;
use crate::config::filter::ProxyConfigFilter;
use crate::config::route_validator::{PolicyLookup, StaticPolicies};
use crate::config::schema::ProxySettings;
use crate::config::source::ConfigSource;
use crate::health::active::{HttpProbeClient, ProbeClient};
use crate::health::coordinator::HealthCoordinator;
use crate::health::worker::HealthProbeWorker;
use crate::lifecycle::shutdown::Shutdown;
use crate::load_balancer::random_source::{RandomSource, ThreadRandom};
use crate::load_balancer::LoadBalancer;
use crate::management::config_manager::ProxyConfigManager;
use crate::observability::metrics::{MetricsTelemetry, NullTelemetry, TelemetrySink};
use crate::proxy::dispatcher::RequestDispatcher;
use crate::proxy::forwarder::{HttpForwarder, HyperForwarder};
use crate::registry::PolicyRegistries;
use crate::runtime::{ClusterManager, RouteManager};

/// Collects the pieces of a [`ProxyRuntime`].
pub struct ProxyRuntimeBuilder {
    source: Arc<dyn ConfigSource>,
    settings: ProxySettings,
    filters: Vec<Arc<dyn ProxyConfigFilter>>,
    policy_lookup: Option<Arc<dyn PolicyLookup>>,
    registries: Option<Arc<PolicyRegistries>>,
    random: Option<Arc<dyn RandomSource>>,
    forwarder: Option<Arc<dyn HttpForwarder>>,
    probe_client: Option<Arc<dyn ProbeClient>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ProxyRuntimeBuilder {
    pub fn settings(mut self, settings: ProxySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Append a config filter. Filters run in registration order.
    pub fn filter(mut self, filter: Arc<dyn ProxyConfigFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Authorization and CORS policy names routes may reference.
    pub fn policy_lookup(mut self, lookup: Arc<dyn PolicyLookup>) -> Self {
        self.policy_lookup = Some(lookup);
        self
    }

    /// Replace the built-in policy registries.
    pub fn registries(mut self, registries: PolicyRegistries) -> Self {
        self.registries = Some(Arc::new(registries));
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<dyn HttpForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn probe_client(mut self, client: Arc<dyn ProbeClient>) -> Self {
        self.probe_client = Some(client);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> ProxyRuntime {
        let settings = self.settings;
        let registries = self
            .registries
            .unwrap_or_else(|| Arc::new(PolicyRegistries::builtin()));
        let random = self.random.unwrap_or_else(|| Arc::new(ThreadRandom));
        let telemetry = self.telemetry.unwrap_or_else(|| -> Arc<dyn TelemetrySink> {
            if settings.observability.metrics_enabled {
                Arc::new(MetricsTelemetry)
            } else {
                Arc::new(NullTelemetry)
            }
        });
        let policy_lookup = self
            .policy_lookup
            .unwrap_or_else(|| Arc::new(StaticPolicies::new()));

        let clusters = Arc::new(ClusterManager::new());
        let routes = Arc::new(RouteManager::new());

        let coordinator = Arc::new(HealthCoordinator::new(registries.clone(), telemetry.clone()));
        let worker = Arc::new(HealthProbeWorker::new(
            settings.health.max_concurrent_probes,
            self.probe_client.unwrap_or_else(|| Arc::new(HttpProbeClient::new())),
            coordinator.clone(),
        ));

        let config_manager = Arc::new(ProxyConfigManager::new(
            self.source,
            DynamicConfigBuilder::new(self.filters, policy_lookup, registries.clone()),
            clusters.clone(),
            routes.clone(),
            coordinator.clone(),
            worker.clone(),
            settings.health.clone(),
            settings.reconciliation.interval(),
        ));

        let dispatcher = Arc::new(RequestDispatcher::new(
            LoadBalancer::new(registries.load_balancing.clone(), random.clone()),
            SessionAffinity::new(
                registries.affinity_providers.clone(),
                registries.affinity_failure_policies.clone(),
                random,
            ),
            self.forwarder.unwrap_or_else(|| Arc::new(HyperForwarder::new())),
            coordinator.clone(),
            telemetry,
            settings.proxy.clone(),
        ));

        info!(
            max_concurrent_probes = settings.health.max_concurrent_probes,
            interval = ?settings.reconciliation.interval(),
            "Proxy runtime built"
        );

        ProxyRuntime {
            settings,
            clusters,
            routes,
            coordinator,
            worker,
            config_manager,
            dispatcher,
            shutdown: Shutdown::new(),
            stopped: AtomicBool::new(false),
        }
    }
}

/// The assembled control plane and dispatch core.
pub struct ProxyRuntime {
    settings: ProxySettings,
    clusters: Arc<ClusterManager>,
    routes: Arc<RouteManager>,
    coordinator: Arc<HealthCoordinator>,
    worker: Arc<HealthProbeWorker>,
    config_manager: Arc<ProxyConfigManager>,
    dispatcher: Arc<RequestDispatcher>,
    shutdown: Shutdown,
    stopped: AtomicBool,
}

impl ProxyRuntime {
    pub fn builder(source: Arc<dyn ConfigSource>) -> ProxyRuntimeBuilder {
        ProxyRuntimeBuilder {
            source,
            settings: ProxySettings::default(),
            filters: Vec::new(),
            policy_lookup: None,
            registries: None,
            random: None,
            forwarder: None,
            probe_client: None,
            telemetry: None,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    pub fn config_manager(&self) -> &Arc<ProxyConfigManager> {
        &self.config_manager
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn health_coordinator(&self) -> &Arc<HealthCoordinator> {
        &self.coordinator
    }

    /// Spawn the reconciliation loop. It exits when [`shutdown`](Self::shutdown) runs.
    pub fn spawn_reconciliation(&self) -> JoinHandle<()> {
        let manager = self.config_manager.clone();
        let signal = self.shutdown.subscribe();
        tokio::spawn(async move { manager.run(signal).await })
    }

    /// Stop the reconciliation loop, all probers and reactivation timers.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Proxy runtime shutting down");
        self.shutdown.trigger();
        self.worker.stop().await;
        self.coordinator.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::InMemoryConfigSource;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let runtime = ProxyRuntime::builder(Arc::new(InMemoryConfigSource::default()))
            .telemetry(Arc::new(NullTelemetry))
            .build();
        let handle = runtime.spawn_reconciliation();

        runtime.shutdown().await;
        runtime.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_pass_with_empty_source() {
        let runtime = ProxyRuntime::builder(Arc::new(InMemoryConfigSource::default())).build();
        let report = runtime.config_manager().apply_configuration().await.unwrap();
        assert!(report.applied);
        assert!(runtime.clusters().is_empty());
        assert!(runtime.routes().is_empty());
    }
}
