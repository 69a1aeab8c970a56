//! Cookie based affinity.
//!
//! Settings (all optional): `CookiePath` (default `/`), `CookieDomain`,
//! `CookieHttpOnly` (default true), `CookieSecure`, `CookieSameSite`,
//! `CookieMaxAgeSeconds`.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};

use crate::affinity::{KeyExtraction, SessionAffinityProvider};
use crate::config::schema::{names, SessionAffinityOptions};

pub const DEFAULT_COOKIE_NAME: &str = ".Proxy.Affinity";

#[derive(Debug, Default)]
pub struct CookieAffinity;

impl CookieAffinity {
    fn cookie_name(options: &SessionAffinityOptions) -> &str {
        options
            .affinity_key_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_COOKIE_NAME)
    }
}

impl SessionAffinityProvider for CookieAffinity {
    fn mode(&self) -> &'static str {
        names::AFFINITY_COOKIE
    }

    fn extract_key(&self, headers: &HeaderMap, options: &SessionAffinityOptions) -> KeyExtraction {
        let name = Self::cookie_name(options);
        for header in headers.get_all(COOKIE) {
            let Ok(header) = header.to_str() else {
                return KeyExtraction::Failed;
            };
            for pair in header.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    if k == name {
                        return KeyExtraction::Found(v.trim_matches('"').to_string());
                    }
                }
            }
        }
        KeyExtraction::NotSet
    }

    fn affinitize(&self, headers: &mut HeaderMap, encoded_key: &str, options: &SessionAffinityOptions) {
        let settings = &options.settings;
        let mut cookie = format!(
            "{}={}; path={}",
            Self::cookie_name(options),
            encoded_key,
            settings.get("CookiePath").map(String::as_str).unwrap_or("/")
        );
        if let Some(domain) = settings.get("CookieDomain") {
            cookie.push_str(&format!("; domain={domain}"));
        }
        if let Some(max_age) = settings.get("CookieMaxAgeSeconds") {
            cookie.push_str(&format!("; max-age={max_age}"));
        }
        if let Some(same_site) = settings.get("CookieSameSite") {
            cookie.push_str(&format!("; samesite={}", same_site.to_ascii_lowercase()));
        }
        if settings.get("CookieSecure").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            cookie.push_str("; secure");
        }
        if !settings.get("CookieHttpOnly").is_some_and(|v| v.eq_ignore_ascii_case("false")) {
            cookie.push_str("; httponly");
        }

        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build affinity cookie"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SessionAffinityOptions {
        SessionAffinityOptions {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_affinitize_writes_set_cookie() {
        let mut opts = options();
        opts.settings.insert("CookieSecure".into(), "true".into());
        let mut headers = HeaderMap::new();
        CookieAffinity.affinitize(&mut headers, "d1", &opts);

        assert_eq!(headers[SET_COOKIE], ".Proxy.Affinity=d1; path=/; secure; httponly");
    }

    #[test]
    fn test_extract_key_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1; .Proxy.Affinity=d2; b=2"));
        assert_eq!(
            CookieAffinity.extract_key(&headers, &options()),
            KeyExtraction::Found("d2".into())
        );

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1"));
        assert_eq!(CookieAffinity.extract_key(&headers, &options()), KeyExtraction::NotSet);
    }

    #[test]
    fn test_custom_cookie_name() {
        let mut opts = options();
        opts.affinity_key_name = Some("sticky".into());
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("sticky=d9"));
        assert_eq!(CookieAffinity.extract_key(&headers, &opts), KeyExtraction::Found("d9".into()));
    }
}
