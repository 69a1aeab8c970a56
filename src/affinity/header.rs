//! Custom header based affinity.

use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue};

use crate::affinity::{KeyExtraction, SessionAffinityProvider};
use crate::config::schema::{names, SessionAffinityOptions};

pub const DEFAULT_HEADER_NAME: &str = "X-Proxy-Affinity";

/// Carries the key in a request header and returns it in the same response header.
#[derive(Debug, Default)]
pub struct CustomHeaderAffinity;

impl CustomHeaderAffinity {
    fn header_name(options: &SessionAffinityOptions) -> Option<HeaderName> {
        let name = options
            .affinity_key_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_HEADER_NAME);
        HeaderName::from_bytes(name.as_bytes()).ok()
    }
}

impl SessionAffinityProvider for CustomHeaderAffinity {
    fn mode(&self) -> &'static str {
        names::AFFINITY_CUSTOM_HEADER
    }

    fn extract_key(&self, headers: &HeaderMap, options: &SessionAffinityOptions) -> KeyExtraction {
        let Some(name) = Self::header_name(options) else {
            return KeyExtraction::Failed;
        };
        let mut values = headers.get_all(&name).iter();
        match (values.next(), values.next()) {
            (None, _) => KeyExtraction::NotSet,
            (Some(value), None) => match value.to_str() {
                Ok(key) => KeyExtraction::Found(key.to_string()),
                Err(_) => KeyExtraction::Failed,
            },
            // More than one value is ambiguous
            (Some(_), Some(_)) => KeyExtraction::Failed,
        }
    }

    fn affinitize(&self, headers: &mut HeaderMap, encoded_key: &str, options: &SessionAffinityOptions) {
        let Some(name) = Self::header_name(options) else {
            tracing::warn!(name = ?options.affinity_key_name, "Invalid affinity header name");
            return;
        };
        match HeaderValue::from_str(encoded_key) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build affinity header"),
        }
    }
}
