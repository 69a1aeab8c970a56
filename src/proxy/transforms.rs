//! Request and response transforms.
//!
//! Routes carry their transforms as raw string dictionaries. They are parsed
//! into [`Transforms`] while the route is validated, so a malformed entry
//! drops the route at config-apply time instead of failing requests.
//!
//! Supported entries:
//! - `PathPrefix`, `PathRemovePrefix`, `PathSet`
//! - `QueryValueParameter` + `Set` | `Append`, `QueryRemoveParameter`
//! - `HttpMethodChange` + `Set`
//! - `RequestHeadersCopy`, `RequestHeader` + `Set` | `Append`, `RequestHeaderRemove`
//! - `X-Forwarded` listing any of `For`, `Proto`, `Host`, `PathBase` (+ optional `Append`)
//! - `ResponseHeader` + `Set` | `Append` (+ optional `When`), `ResponseHeaderRemove`

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use thiserror::Error;
use url::form_urlencoded;

/// Rejected transform definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransformBuildError(pub String);

/// Failure while applying a transform to a live request or response.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("header capacity exceeded while applying {0}")]
    HeaderCapacity(&'static str),

    #[error("invalid header value produced by {0}")]
    InvalidHeaderValue(&'static str),
}

/// Headers that only make sense for a single hop.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers before forwarding a message.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTransform {
    PathPrefix(String),
    PathRemovePrefix(String),
    PathSet(String),
    QueryValue { key: String, value: String, append: bool },
    QueryRemove(String),
    MethodChange { from: Method, to: Method },
    HeaderValue { name: HeaderName, value: HeaderValue, append: bool },
    HeaderRemove(HeaderName),
    XForwarded { headers: XForwardedHeaders, append: bool },
}

/// Headers selected by an `X-Forwarded` transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XForwardedHeaders {
    pub for_: bool,
    pub proto: bool,
    pub host: bool,
    pub path_base: bool,
}

impl XForwardedHeaders {
    fn parse(list: &str) -> Result<Self, TransformBuildError> {
        let mut headers = Self::default();
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "for" => headers.for_ = true,
                "proto" => headers.proto = true,
                "host" => headers.host = true,
                "pathbase" => headers.path_base = true,
                _ => return Err(invalid(format!("Unknown X-Forwarded header '{token}'"))),
            }
        }
        if headers == Self::default() {
            return Err(invalid("X-Forwarded requires at least one of For, Proto, Host, PathBase"));
        }
        Ok(headers)
    }
}

/// Prefix the host mounted the proxy under, inserted as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBase(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseTransform {
    HeaderValue {
        name: HeaderName,
        value: HeaderValue,
        append: bool,
        /// Apply to error responses too, not only 2xx.
        always: bool,
    },
    HeaderRemove(HeaderName),
}

/// Parsed transforms of one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transforms {
    /// Copy incoming request headers to the upstream request.
    pub copy_request_headers: bool,
    pub request: Vec<RequestTransform>,
    pub response: Vec<ResponseTransform>,
}

impl Default for Transforms {
    fn default() -> Self {
        Self {
            copy_request_headers: true,
            request: Vec::new(),
            response: Vec::new(),
        }
    }
}

/// Mutable view of the outgoing request that request transforms operate on.
#[derive(Debug, Clone)]
pub struct RequestTransformContext {
    pub method: Method,
    pub path: String,
    pub query: QueryParams,
    pub headers: HeaderMap,
    /// `Host` header of the incoming request.
    pub original_host: Option<HeaderValue>,
    pub client_addr: Option<SocketAddr>,
    pub scheme: String,
    pub path_base: Option<String>,
}

/// Ordered query parameters, kept in their encoded form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, Option<String>)>);

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .unwrap_or_default()
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (pair.to_string(), None),
            })
            .collect();
        Self(pairs)
    }

    /// Replace every value of `key`. Key and value are given unencoded.
    pub fn set(&mut self, key: &str, value: &str) {
        self.remove(key);
        self.append(key, value);
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.0.push((encode(key), Some(encode(value))));
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| !decode(k).eq_ignore_ascii_case(key));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encoded query string without the leading `?`.
    pub fn to_query_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}={v}"),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn encode(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

fn decode(text: &str) -> String {
    form_urlencoded::parse(text.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

impl Transforms {
    /// Parse the raw transform list of a route.
    pub fn build(raw: &[BTreeMap<String, String>]) -> Result<Self, TransformBuildError> {
        let mut transforms = Transforms::default();
        for entry in raw {
            transforms.add(entry)?;
        }
        Ok(transforms)
    }

    fn add(&mut self, entry: &BTreeMap<String, String>) -> Result<(), TransformBuildError> {
        let get = |key: &str| entry.get(key).map(String::as_str);

        if let Some(prefix) = get("PathPrefix") {
            expect_len(entry, 1)?;
            self.request.push(RequestTransform::PathPrefix(path_value(prefix)?));
        } else if let Some(prefix) = get("PathRemovePrefix") {
            expect_len(entry, 1)?;
            self.request.push(RequestTransform::PathRemovePrefix(path_value(prefix)?));
        } else if let Some(path) = get("PathSet") {
            expect_len(entry, 1)?;
            self.request.push(RequestTransform::PathSet(path_value(path)?));
        } else if let Some(key) = get("QueryValueParameter") {
            expect_len(entry, 2)?;
            if key.is_empty() {
                return Err(invalid("QueryValueParameter requires a parameter name"));
            }
            let (value, append) = set_or_append(entry, "QueryValueParameter")?;
            self.request.push(RequestTransform::QueryValue {
                key: key.to_string(),
                value: value.to_string(),
                append,
            });
        } else if let Some(key) = get("QueryRemoveParameter") {
            expect_len(entry, 1)?;
            if key.is_empty() {
                return Err(invalid("QueryRemoveParameter requires a parameter name"));
            }
            self.request.push(RequestTransform::QueryRemove(key.to_string()));
        } else if let Some(from) = get("HttpMethodChange") {
            expect_len(entry, 2)?;
            let to = get("Set").ok_or_else(|| invalid("HttpMethodChange requires 'Set'"))?;
            self.request.push(RequestTransform::MethodChange {
                from: method_value(from)?,
                to: method_value(to)?,
            });
        } else if let Some(flag) = get("RequestHeadersCopy") {
            expect_len(entry, 1)?;
            self.copy_request_headers = bool_value("RequestHeadersCopy", flag)?;
        } else if let Some(name) = get("RequestHeader") {
            expect_len(entry, 2)?;
            let (value, append) = set_or_append(entry, "RequestHeader")?;
            self.request.push(RequestTransform::HeaderValue {
                name: header_name(name)?,
                value: header_value(value)?,
                append,
            });
        } else if let Some(name) = get("RequestHeaderRemove") {
            expect_len(entry, 1)?;
            self.request.push(RequestTransform::HeaderRemove(header_name(name)?));
        } else if let Some(list) = get("X-Forwarded") {
            let headers = XForwardedHeaders::parse(list)?;
            let append = match get("Append") {
                Some(flag) => {
                    expect_len(entry, 2)?;
                    bool_value("Append", flag)?
                }
                None => {
                    expect_len(entry, 1)?;
                    true
                }
            };
            self.request.push(RequestTransform::XForwarded { headers, append });
        } else if let Some(name) = get("ResponseHeader") {
            let always = match get("When") {
                Some(when) => {
                    expect_len(entry, 3)?;
                    match when.to_ascii_lowercase().as_str() {
                        "success" => false,
                        "always" => true,
                        _ => return Err(invalid(format!("Unexpected value for ResponseHeader 'When': '{when}'"))),
                    }
                }
                None => {
                    expect_len(entry, 2)?;
                    false
                }
            };
            let (value, append) = set_or_append(entry, "ResponseHeader")?;
            self.response.push(ResponseTransform::HeaderValue {
                name: header_name(name)?,
                value: header_value(value)?,
                append,
                always,
            });
        } else if let Some(name) = get("ResponseHeaderRemove") {
            expect_len(entry, 1)?;
            self.response.push(ResponseTransform::HeaderRemove(header_name(name)?));
        } else {
            let keys: Vec<_> = entry.keys().map(String::as_str).collect();
            return Err(invalid(format!("Unknown transform: {}", keys.join(";"))));
        }
        Ok(())
    }

    /// Apply request transforms in declaration order.
    pub fn apply_request(&self, ctx: &mut RequestTransformContext) -> Result<(), TransformError> {
        for transform in &self.request {
            match transform {
                RequestTransform::PathPrefix(prefix) => {
                    ctx.path = format!("{}{}", prefix.trim_end_matches('/'), ctx.path);
                }
                RequestTransform::PathRemovePrefix(prefix) => {
                    if let Some(rest) = ctx.path.strip_prefix(prefix.as_str()) {
                        if rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/') {
                            ctx.path = if rest.starts_with('/') {
                                rest.to_string()
                            } else {
                                format!("/{rest}")
                            };
                        }
                    }
                }
                RequestTransform::PathSet(path) => ctx.path = path.clone(),
                RequestTransform::QueryValue { key, value, append } => {
                    if value.is_empty() {
                        continue;
                    }
                    if *append {
                        ctx.query.append(key, value);
                    } else {
                        ctx.query.set(key, value);
                    }
                }
                RequestTransform::QueryRemove(key) => ctx.query.remove(key),
                RequestTransform::MethodChange { from, to } => {
                    if ctx.method == *from {
                        ctx.method = to.clone();
                    }
                }
                RequestTransform::HeaderValue { name, value, append } => {
                    write_header(&mut ctx.headers, name, value.clone(), *append, "RequestHeader")?;
                }
                RequestTransform::HeaderRemove(name) => {
                    ctx.headers.remove(name);
                }
                RequestTransform::XForwarded { headers, append } => apply_x_forwarded(ctx, *headers, *append)?,
            }
        }
        Ok(())
    }

    /// Apply response transforms. `success` is true for 2xx responses.
    pub fn apply_response(&self, success: bool, headers: &mut HeaderMap) -> Result<(), TransformError> {
        for transform in &self.response {
            match transform {
                ResponseTransform::HeaderValue {
                    name,
                    value,
                    append,
                    always,
                } => {
                    if success || *always {
                        write_header(headers, name, value.clone(), *append, "ResponseHeader")?;
                    }
                }
                ResponseTransform::HeaderRemove(name) => {
                    headers.remove(name);
                }
            }
        }
        Ok(())
    }
}

fn apply_x_forwarded(
    ctx: &mut RequestTransformContext,
    selected: XForwardedHeaders,
    append: bool,
) -> Result<(), TransformError> {
    let mut values = Vec::with_capacity(4);
    if selected.proto {
        values.push((HeaderName::from_static("x-forwarded-proto"), Some(ctx.scheme.clone())));
    }
    if selected.host {
        values.push((
            HeaderName::from_static("x-forwarded-host"),
            ctx.original_host
                .as_ref()
                .and_then(|h| h.to_str().ok())
                .map(str::to_string),
        ));
    }
    if selected.for_ {
        values.push((
            HeaderName::from_static("x-forwarded-for"),
            ctx.client_addr.map(|addr| addr.ip().to_string()),
        ));
    }
    if selected.path_base {
        values.push((
            HeaderName::from_static("x-forwarded-pathbase"),
            ctx.path_base.clone().filter(|base| !base.is_empty()),
        ));
    }

    for (name, value) in values {
        let Some(value) = value else {
            if !append {
                ctx.headers.remove(&name);
            }
            continue;
        };
        let combined = match ctx.headers.get(&name).and_then(|v| v.to_str().ok()) {
            Some(existing) if append && !existing.is_empty() => format!("{existing}, {value}"),
            _ => value,
        };
        let value = HeaderValue::from_str(&combined).map_err(|_| TransformError::InvalidHeaderValue("X-Forwarded"))?;
        write_header(&mut ctx.headers, &name, value, false, "X-Forwarded")?;
    }
    Ok(())
}

fn write_header(
    headers: &mut HeaderMap,
    name: &HeaderName,
    value: HeaderValue,
    append: bool,
    transform: &'static str,
) -> Result<(), TransformError> {
    if append {
        headers
            .try_append(name.clone(), value)
            .map_err(|_| TransformError::HeaderCapacity(transform))?;
    } else {
        headers
            .try_insert(name.clone(), value)
            .map_err(|_| TransformError::HeaderCapacity(transform))?;
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> TransformBuildError {
    TransformBuildError(message.into())
}

fn expect_len(entry: &BTreeMap<String, String>, expected: usize) -> Result<(), TransformBuildError> {
    if entry.len() > expected {
        let keys: Vec<_> = entry.keys().map(String::as_str).collect();
        return Err(invalid(format!("The transform contains more parameters than expected: {}", keys.join(";"))));
    }
    Ok(())
}

fn set_or_append<'a>(
    entry: &'a BTreeMap<String, String>,
    transform: &str,
) -> Result<(&'a str, bool), TransformBuildError> {
    if let Some(value) = entry.get("Set") {
        Ok((value, false))
    } else if let Some(value) = entry.get("Append") {
        Ok((value, true))
    } else {
        Err(invalid(format!("{transform} requires 'Set' or 'Append'")))
    }
}

fn path_value(path: &str) -> Result<String, TransformBuildError> {
    if !path.starts_with('/') {
        return Err(invalid(format!("Path '{path}' must start with '/'")));
    }
    Ok(path.to_string())
}

fn method_value(method: &str) -> Result<Method, TransformBuildError> {
    if method.is_empty() {
        return Err(invalid("HTTP method must not be empty"));
    }
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| invalid(format!("Invalid HTTP method '{method}'")))
}

fn bool_value(key: &str, value: &str) -> Result<bool, TransformBuildError> {
    value
        .to_ascii_lowercase()
        .parse::<bool>()
        .map_err(|_| invalid(format!("Unexpected value for {key}: '{value}'")))
}

fn header_name(name: &str) -> Result<HeaderName, TransformBuildError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(format!("Invalid header name '{name}'")))
}

fn header_value(value: &str) -> Result<HeaderValue, TransformBuildError> {
    HeaderValue::from_str(value).map_err(|_| invalid(format!("Invalid header value '{value}'")))
}
