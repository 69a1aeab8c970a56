//! Session affinity subsystem.
//!
//! # Data Flow
//! ```text
//! Request
//!     → SessionAffinity::lookup
//!         → provider (cookie.rs / header.rs) extracts the key
//!         → key matched against eligible destinations
//!         → OK: destination overrides load balancing
//!         → KeyNotSet: normal selection
//!         → KeyExtractionFailed / DestinationNotFound
//!             → failure_policy.rs decides: redistribute or abort
//! Response
//!     → SessionAffinity::establish
//!         → provider writes the chosen destination id
//! ```
//!
//! # Design Decisions
//! - Providers only move keys in and out of headers; matching is shared
//! - The key is the destination id, form-url-encoded
//! - Establish is skipped when there is nothing to choose between

pub mod cookie;
pub mod failure_policy;
pub mod header;

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::config::schema::{names, SessionAffinityOptions};
use crate::load_balancer::RandomSource;
use crate::proxy::error::SelectionError;
use crate::registry::NamedRegistry;
use crate::runtime::destination::DestinationInfo;

/// Result category of an affinity lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityStatus {
    Ok,
    KeyNotSet,
    KeyExtractionFailed,
    DestinationNotFound,
}

/// Lookup result with the matching destinations.
#[derive(Debug, Clone)]
pub struct AffinityResult {
    pub status: AffinityStatus,
    pub destinations: Vec<Arc<DestinationInfo>>,
}

impl AffinityResult {
    fn status(status: AffinityStatus) -> Self {
        Self {
            status,
            destinations: Vec::new(),
        }
    }
}

/// Raw key as carried by the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExtraction {
    NotSet,
    Found(String),
    Failed,
}

/// Transports the affinity key in request and response headers.
pub trait SessionAffinityProvider: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Read the encoded key from the request.
    fn extract_key(&self, headers: &HeaderMap, options: &SessionAffinityOptions) -> KeyExtraction;

    /// Write the encoded key for `destination` to the response.
    fn affinitize(&self, headers: &mut HeaderMap, encoded_key: &str, options: &SessionAffinityOptions);
}

/// Decides whether a request with a broken affinity continues.
pub trait AffinityFailurePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return true to keep processing the request.
    fn handle(&self, cluster_id: &str, status: AffinityStatus) -> bool;
}

/// Outcome of [`SessionAffinity::lookup`].
#[derive(Debug, Clone)]
pub enum AffinityLookup {
    /// Affinity is disabled for the cluster.
    Disabled,
    /// Use this destination.
    Resolved(Arc<DestinationInfo>),
    /// Fall back to load balancing.
    Proceed(AffinityStatus),
    /// Stop the request.
    Abort(AffinityStatus),
}

/// Runs providers and failure policies by name.
pub struct SessionAffinity {
    providers: Arc<NamedRegistry<dyn SessionAffinityProvider>>,
    failure_policies: Arc<NamedRegistry<dyn AffinityFailurePolicy>>,
    random: Arc<dyn RandomSource>,
}

impl SessionAffinity {
    pub fn new(
        providers: Arc<NamedRegistry<dyn SessionAffinityProvider>>,
        failure_policies: Arc<NamedRegistry<dyn AffinityFailurePolicy>>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            providers,
            failure_policies,
            random,
        }
    }

    fn provider(&self, options: &SessionAffinityOptions) -> Result<Arc<dyn SessionAffinityProvider>, SelectionError> {
        let mode = options.mode.as_deref().unwrap_or(names::AFFINITY_COOKIE);
        self.providers
            .get(mode)
            .ok_or_else(|| SelectionError::UnknownAffinityProvider(mode.to_string()))
    }

    /// Match the request's key against `eligible`.
    pub fn find_affinitized(
        &self,
        options: &SessionAffinityOptions,
        headers: &HeaderMap,
        eligible: &[Arc<DestinationInfo>],
    ) -> Result<AffinityResult, SelectionError> {
        let provider = self.provider(options)?;
        let key = match provider.extract_key(headers, options) {
            KeyExtraction::NotSet => return Ok(AffinityResult::status(AffinityStatus::KeyNotSet)),
            KeyExtraction::Failed => return Ok(AffinityResult::status(AffinityStatus::KeyExtractionFailed)),
            KeyExtraction::Found(raw) => match decode_key(&raw) {
                Some(key) => key,
                None => return Ok(AffinityResult::status(AffinityStatus::KeyExtractionFailed)),
            },
        };

        let destinations: Vec<_> = eligible.iter().filter(|d| d.id() == key).cloned().collect();
        if destinations.is_empty() {
            return Ok(AffinityResult::status(AffinityStatus::DestinationNotFound));
        }
        Ok(AffinityResult {
            status: AffinityStatus::Ok,
            destinations,
        })
    }

    /// Resolve a previously affinitized destination.
    pub fn lookup(
        &self,
        cluster_id: &str,
        options: &SessionAffinityOptions,
        headers: &HeaderMap,
        eligible: &[Arc<DestinationInfo>],
    ) -> Result<AffinityLookup, SelectionError> {
        if !options.enabled {
            return Ok(AffinityLookup::Disabled);
        }

        let result = self.find_affinitized(options, headers, eligible)?;
        match result.status {
            AffinityStatus::Ok => {
                let index = match result.destinations.len() {
                    1 => 0,
                    n => self.random.next_index(n),
                };
                Ok(AffinityLookup::Resolved(result.destinations[index].clone()))
            }
            AffinityStatus::KeyNotSet => Ok(AffinityLookup::Proceed(AffinityStatus::KeyNotSet)),
            status => {
                let name = options
                    .failure_policy
                    .as_deref()
                    .unwrap_or(names::AFFINITY_FAILURE_REDISTRIBUTE);
                let policy = self
                    .failure_policies
                    .get(name)
                    .ok_or_else(|| SelectionError::UnknownAffinityFailurePolicy(name.to_string()))?;
                if policy.handle(cluster_id, status) {
                    Ok(AffinityLookup::Proceed(status))
                } else {
                    Ok(AffinityLookup::Abort(status))
                }
            }
        }
    }

    /// Persist the binding to `destination` on the response.
    /// Skipped when at most one destination was eligible.
    pub fn establish(
        &self,
        options: &SessionAffinityOptions,
        eligible_count: usize,
        destination: &DestinationInfo,
        response_headers: &mut HeaderMap,
    ) -> Result<(), SelectionError> {
        if !options.enabled || eligible_count <= 1 {
            return Ok(());
        }
        let provider = self.provider(options)?;
        provider.affinitize(response_headers, &encode_key(destination.id()), options);
        Ok(())
    }
}

/// Registry with the cookie and custom header providers.
pub fn builtin_providers() -> NamedRegistry<dyn SessionAffinityProvider> {
    let mut registry: NamedRegistry<dyn SessionAffinityProvider> = NamedRegistry::new("session affinity provider");
    let providers: [Arc<dyn SessionAffinityProvider>; 2] =
        [Arc::new(cookie::CookieAffinity), Arc::new(header::CustomHeaderAffinity)];
    for provider in providers {
        registry.register(provider.mode(), provider);
    }
    registry
}

/// Registry with the redistribute and 503 failure policies.
pub fn builtin_failure_policies() -> NamedRegistry<dyn AffinityFailurePolicy> {
    let mut registry: NamedRegistry<dyn AffinityFailurePolicy> = NamedRegistry::new("affinity failure policy");
    let policies: [Arc<dyn AffinityFailurePolicy>; 2] = [
        Arc::new(failure_policy::Redistribute),
        Arc::new(failure_policy::Return503Error),
    ];
    for policy in policies {
        registry.register(policy.name(), policy);
    }
    registry
}

fn encode_key(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

fn decode_key(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.contains(['&', '=']) {
        return None;
    }
    let (key, _) = url::form_urlencoded::parse(raw.as_bytes()).next()?;
    if key.is_empty() || key.contains('\u{FFFD}') {
        return None;
    }
    Some(key.into_owned())
}
