//! Route validation.
//!
//! # Responsibilities
//! - Host pattern syntax (exact names, `*.` wildcard prefix, optional port)
//! - Path template syntax (`/a/{id}/{**rest}`)
//! - HTTP method enumeration
//! - Existence of named authorization and CORS policies
//!
//! # Design Decisions
//! - Every failure is reported; the caller drops the route if any was found
//! - Policy existence is answered by an external [`PolicyLookup`]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::errors::{ConfigErrorCode, ConfigErrors, ConfigValidationError};
use crate::config::parsed::ParsedRoute;

/// Authorization policy names handled by the host itself.
const RESERVED_AUTHORIZATION_POLICIES: [&str; 1] = ["default"];

/// CORS policy names handled by the host itself.
const RESERVED_CORS_POLICIES: [&str; 2] = ["default", "disable"];

const KNOWN_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "TRACE", "CONNECT",
];

/// Answers whether a named policy exists.
pub trait PolicyLookup: Send + Sync {
    fn authorization_policy_exists(&self, name: &str) -> bool;
    fn cors_policy_exists(&self, name: &str) -> bool;
}

/// A fixed set of policy names.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicies {
    authorization: BTreeSet<String>,
    cors: BTreeSet<String>,
}

impl StaticPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authorization_policy(mut self, name: &str) -> Self {
        self.authorization.insert(name.to_ascii_lowercase());
        self
    }

    pub fn with_cors_policy(mut self, name: &str) -> Self {
        self.cors.insert(name.to_ascii_lowercase());
        self
    }
}

impl PolicyLookup for StaticPolicies {
    fn authorization_policy_exists(&self, name: &str) -> bool {
        self.authorization.contains(&name.to_ascii_lowercase())
    }

    fn cors_policy_exists(&self, name: &str) -> bool {
        self.cors.contains(&name.to_ascii_lowercase())
    }
}

/// Validates parsed routes.
pub struct RouteValidator {
    policies: Arc<dyn PolicyLookup>,
}

impl RouteValidator {
    pub fn new(policies: Arc<dyn PolicyLookup>) -> Self {
        Self { policies }
    }

    /// Report every problem with `route`. Returns true when the route is valid.
    pub fn validate_route(&self, route: &ParsedRoute, errors: &mut ConfigErrors) -> bool {
        let before = errors.len();
        let id = route.route_id.as_str();
        let report = |errors: &mut ConfigErrors, code, message: String| {
            errors.report(ConfigValidationError::route(id, code, message));
        };

        if id.is_empty() {
            report(errors, ConfigErrorCode::RouteMissingId, "Route requires a route id".to_string());
            return false;
        }

        let has_path = route.path.as_deref().is_some_and(|p| !p.is_empty());
        if route.hosts.is_empty() && !has_path {
            report(
                errors,
                ConfigErrorCode::RouteHasNoMatchers,
                format!("Route '{id}' requires Hosts or Path specified. Set the Path to '/{{**catchall}}' to match all requests."),
            );
        }

        for host in &route.hosts {
            if host.is_empty() {
                report(errors, ConfigErrorCode::RouteHasNoMatchers, format!("Empty host name has been set for route '{id}'."));
            } else if !is_valid_host(host) {
                report(errors, ConfigErrorCode::RouteInvalidMatcher, format!("Invalid host name '{host}' for route '{id}'."));
            }
        }

        if let Some(path) = route.path.as_deref().filter(|p| !p.is_empty()) {
            if let Err(detail) = validate_path_template(path) {
                report(
                    errors,
                    ConfigErrorCode::RouteInvalidMatcher,
                    format!("Invalid path pattern '{path}' for route '{id}': {detail}"),
                );
            }
        }

        if let Some(methods) = &route.methods {
            let mut seen = HashSet::new();
            for method in methods {
                if !KNOWN_METHODS.contains(&method.as_str()) {
                    report(
                        errors,
                        ConfigErrorCode::RouteInvalidMatcher,
                        format!("Unsupported HTTP method '{method}' has been set for route '{id}'. Check the verb list."),
                    );
                } else if !seen.insert(method.as_str()) {
                    report(
                        errors,
                        ConfigErrorCode::RouteInvalidMatcher,
                        format!("Duplicate HTTP method '{method}' for route '{id}'. Each verb may only be listed once."),
                    );
                }
            }
        }

        if let Some(policy) = route.authorization_policy.as_deref() {
            let reserved = RESERVED_AUTHORIZATION_POLICIES
                .iter()
                .any(|r| r.eq_ignore_ascii_case(policy));
            if !policy.is_empty() && !reserved && !self.policies.authorization_policy_exists(policy) {
                report(
                    errors,
                    ConfigErrorCode::RouteInvalidAuthorizationPolicy,
                    format!("Authorization policy '{policy}' not found for route '{id}'."),
                );
            }
        }

        if let Some(policy) = route.cors_policy.as_deref() {
            let reserved = RESERVED_CORS_POLICIES.iter().any(|r| r.eq_ignore_ascii_case(policy));
            if !policy.is_empty() && !reserved && !self.policies.cors_policy_exists(policy) {
                report(
                    errors,
                    ConfigErrorCode::RouteInvalidCorsPolicy,
                    format!("Cors policy '{policy}' not found for route '{id}'."),
                );
            }
        }

        errors.len() == before
    }
}

/// Host names may start with a single `*.` label and may carry a port.
pub fn is_valid_host(host: &str) -> bool {
    let name = match host.rsplit_once(':') {
        Some((name, port)) => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return false;
            }
            name
        }
        None => host,
    };

    let name = name.strip_prefix("*.").unwrap_or(name);
    if name.is_empty() {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Check route template syntax: balanced braces, well-formed parameter
/// names, at most one catch-all and only in the final segment.
pub fn validate_path_template(template: &str) -> Result<(), String> {
    let trimmed = template
        .strip_prefix("~/")
        .or_else(|| template.strip_prefix('/'))
        .unwrap_or(template);
    if trimmed.is_empty() {
        return Ok(());
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    let last = segments.len() - 1;
    let mut names = HashSet::new();

    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            if index != last {
                return Err("the separator '/' cannot appear consecutively".to_string());
            }
            continue;
        }

        let bytes = segment.as_bytes();
        let mut i = 0;
        let mut parameters = 0;
        let mut previous_was_parameter = false;
        let mut catch_all = false;

        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    i += 2;
                    previous_was_parameter = false;
                }
                b'{' => {
                    let close = segment[i + 1..]
                        .find('}')
                        .map(|offset| i + 1 + offset)
                        .ok_or_else(|| "unterminated parameter".to_string())?;
                    if previous_was_parameter {
                        return Err("parameters must be separated by a literal".to_string());
                    }
                    let content = &segment[i + 1..close];
                    let (name, is_catch_all) = parse_parameter(content)?;
                    if !names.insert(name.to_ascii_lowercase()) {
                        return Err(format!("parameter '{name}' appears more than once"));
                    }
                    catch_all |= is_catch_all;
                    parameters += 1;
                    previous_was_parameter = true;
                    i = close + 1;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    i += 2;
                    previous_was_parameter = false;
                }
                b'}' => return Err("unbalanced '}'".to_string()),
                _ => {
                    i += 1;
                    previous_was_parameter = false;
                }
            }
        }

        if catch_all {
            if index != last {
                return Err("a catch-all parameter can only appear as the last segment".to_string());
            }
            if parameters > 1 || !segment.starts_with('{') || !segment.ends_with('}') {
                return Err("a catch-all parameter cannot be part of a complex segment".to_string());
            }
        }
    }

    Ok(())
}

fn parse_parameter(content: &str) -> Result<(&str, bool), String> {
    if content.contains('{') {
        return Err("unbalanced '{'".to_string());
    }

    let stars = content.bytes().take_while(|b| *b == b'*').count();
    if stars > 2 {
        return Err("a catch-all parameter may only use '*' or '**'".to_string());
    }
    let rest = &content[stars..];

    let end = rest.find([':', '=', '?']).unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        return Err("parameter name is empty".to_string());
    }
    if name.contains('*') {
        return Err(format!("invalid parameter name '{name}'"));
    }

    let optional = rest.ends_with('?');
    if stars > 0 && optional {
        return Err("a catch-all parameter cannot be optional".to_string());
    }

    Ok((name, stars > 0))
}
