//! Named strategy registries.
//!
//! Load balancing policies, affinity providers, affinity failure policies and
//! health policies are all looked up by name. Names compare case-insensitively.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::affinity::{self, AffinityFailurePolicy, SessionAffinityProvider};
use crate::health::active::{ActiveHealthPolicy, ConsecutiveFailuresActivePolicy, StatusCodePolicy};
use crate::health::passive::{ConsecutiveFailuresPassivePolicy, PassiveHealthPolicy, TransportFailureRatePolicy};
use crate::load_balancer::{self, LoadBalancingPolicy};

/// A case-insensitive name → implementation map.
pub struct NamedRegistry<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Arc<T>>,
}

impl<T: ?Sized> NamedRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register an implementation, replacing any previous one with the same name.
    pub fn register(&mut self, name: &str, item: Arc<T>) {
        self.entries.insert(name.to_ascii_lowercase(), item);
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// What this registry holds, for error messages.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> fmt::Debug for NamedRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedRegistry")
            .field("kind", &self.kind)
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Every registry the proxy resolves names against.
///
/// Shared between the config builder (name validation), the dispatcher
/// (selection) and the health subsystem (policy evaluation).
#[derive(Debug)]
pub struct PolicyRegistries {
    pub load_balancing: Arc<NamedRegistry<dyn LoadBalancingPolicy>>,
    pub affinity_providers: Arc<NamedRegistry<dyn SessionAffinityProvider>>,
    pub affinity_failure_policies: Arc<NamedRegistry<dyn AffinityFailurePolicy>>,
    pub active_health: Arc<NamedRegistry<dyn ActiveHealthPolicy>>,
    pub passive_health: Arc<NamedRegistry<dyn PassiveHealthPolicy>>,
}

impl PolicyRegistries {
    /// Registries holding every built-in implementation.
    pub fn builtin() -> Self {
        let mut active: NamedRegistry<dyn ActiveHealthPolicy> = NamedRegistry::new("active health policy");
        let active_policies: [Arc<dyn ActiveHealthPolicy>; 2] =
            [Arc::new(ConsecutiveFailuresActivePolicy), Arc::new(StatusCodePolicy)];
        for policy in active_policies {
            active.register(policy.name(), policy);
        }

        let mut passive: NamedRegistry<dyn PassiveHealthPolicy> = NamedRegistry::new("passive health policy");
        let passive_policies: [Arc<dyn PassiveHealthPolicy>; 2] = [
            Arc::new(ConsecutiveFailuresPassivePolicy),
            Arc::new(TransportFailureRatePolicy),
        ];
        for policy in passive_policies {
            passive.register(policy.name(), policy);
        }

        Self {
            load_balancing: Arc::new(load_balancer::builtin_policies()),
            affinity_providers: Arc::new(affinity::builtin_providers()),
            affinity_failure_policies: Arc::new(affinity::builtin_failure_policies()),
            active_health: Arc::new(active),
            passive_health: Arc::new(passive),
        }
    }
}

impl Default for PolicyRegistries {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry: NamedRegistry<dyn Greeter> = NamedRegistry::new("greeter");
        registry.register("Hello", Arc::new(Hello));

        assert_eq!(registry.get("hello").unwrap().greet(), "hello");
        assert!(registry.contains("HELLO"));
        assert!(registry.get("bye").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_builtin_registries() {
        let registries = PolicyRegistries::builtin();
        assert_eq!(registries.load_balancing.len(), 5);
        assert!(registries.load_balancing.contains("roundrobin"));
        assert!(registries.affinity_providers.contains("CustomHeader"));
        assert!(registries.affinity_failure_policies.contains("Return503Error"));
        assert!(registries.active_health.contains("StatusCode"));
        assert!(registries.passive_health.contains("TransportFailureRate"));
    }
}
