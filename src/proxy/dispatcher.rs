//! Per-request dispatch.
//!
//! # Responsibilities
//! - Choose a destination (affinity first, then load balancing)
//! - Hold in-flight counters for the whole exchange
//! - Transform, forward, and stream both bodies
//! - Report the outcome to the health coordinator and telemetry
//!
//! # Design Decisions
//! - Bodies are never buffered; each direction is one bounded copy loop
//!   between the incoming stream and an in-memory pipe
//! - Failures before response headers map to a status through
//!   [`ProxyErrorKind`]; after headers, the client stream is aborted
//! - The request never waits on reconciliation or probing

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use hyper::body::Body as HttpBody;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::affinity::{AffinityLookup, SessionAffinity};
use crate::config::schema::ForwardingSettings;
use crate::health::coordinator::HealthCoordinator;
use crate::health::passive::RequestOutcome;
use crate::load_balancer::LoadBalancer;
use crate::observability::metrics::{ProxyTags, StreamDirection, TelemetrySink};
use crate::proxy::error::{ProxyError, ProxyErrorKind};
use crate::proxy::forwarder::{ForwardError, HttpForwarder};
use crate::proxy::stream_copier::{self, StreamCopyOutcome, StreamCopyResult};
use crate::proxy::transforms::{strip_hop_by_hop, PathBase, QueryParams, RequestTransformContext, Transforms};
use crate::runtime::cluster::ClusterInfo;
use crate::runtime::destination::DestinationInfo;
use crate::runtime::guard::ConcurrencyGuard;
use crate::runtime::route::RouteInfo;

const REQUEST_ID: &str = "x-request-id";

/// Forwards requests for resolved routes.
pub struct RequestDispatcher {
    load_balancer: LoadBalancer,
    affinity: SessionAffinity,
    forwarder: Arc<dyn HttpForwarder>,
    coordinator: Arc<HealthCoordinator>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: ForwardingSettings,
}

/// State carried from destination selection to the end of the response body.
struct Exchange {
    request_id: String,
    started: Instant,
    guard: ConcurrencyGuard,
    tags: ProxyTags,
}

impl RequestDispatcher {
    pub fn new(
        load_balancer: LoadBalancer,
        affinity: SessionAffinity,
        forwarder: Arc<dyn HttpForwarder>,
        coordinator: Arc<HealthCoordinator>,
        telemetry: Arc<dyn TelemetrySink>,
        settings: ForwardingSettings,
    ) -> Self {
        Self {
            load_balancer,
            affinity,
            forwarder,
            coordinator,
            telemetry,
            settings,
        }
    }

    /// Proxy `request` along `route`. Never fails; errors become responses.
    pub async fn dispatch(&self, route: &RouteInfo, request: Request<Body>, cancel: CancellationToken) -> Response<Body> {
        let started = Instant::now();
        let request_id = request
            .headers()
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        tracing::debug!(
            request_id = %request_id,
            route_id = %route.id(),
            method = %request.method(),
            path = %request.uri().path(),
            "Dispatching request"
        );

        let Some(config) = route.config() else {
            let error = ProxyError::new(ProxyErrorKind::NoAvailableDestinations, "route has no applied configuration");
            return self.fail_early(&request_id, route.id(), "", error);
        };
        let Some(cluster) = config.cluster.clone() else {
            let error = ProxyError::new(ProxyErrorKind::NoAvailableDestinations, "route has no cluster");
            return self.fail_early(&request_id, route.id(), "", error);
        };

        let destination = match self.select_destination(&cluster, request.headers()) {
            Ok(destination) => destination,
            Err(e) => return self.fail_early(&request_id, route.id(), cluster.id(), e),
        };

        let tags = ProxyTags {
            cluster_id: cluster.id().to_string(),
            route_id: route.id().to_string(),
            destination_id: destination.id().to_string(),
            protocol: format!("{:?}", request.version()),
        };
        let exchange = Exchange {
            request_id,
            started,
            guard: ConcurrencyGuard::new(cluster, destination),
            tags,
        };

        self.forward(exchange, &config.transforms, request, cancel).await
    }

    fn select_destination(&self, cluster: &ClusterInfo, headers: &HeaderMap) -> Result<Arc<DestinationInfo>, ProxyError> {
        let config = cluster.config();
        let state = cluster.dynamic_state();
        let eligible = &state.healthy_destinations;
        if eligible.is_empty() {
            return Err(ProxyError::new(
                ProxyErrorKind::NoAvailableDestinations,
                "no eligible destinations",
            ));
        }

        match self
            .affinity
            .lookup(cluster.id(), &config.options.session_affinity, headers, eligible)?
        {
            AffinityLookup::Resolved(destination) => return Ok(destination),
            AffinityLookup::Abort(status) => {
                return Err(ProxyError::new(
                    ProxyErrorKind::AffinityAborted,
                    format!("affinity failure policy stopped the request ({status:?})"),
                ))
            }
            AffinityLookup::Disabled | AffinityLookup::Proceed(_) => {}
        }

        let mode = config.options.load_balancing.mode_or_default();
        self.load_balancer
            .pick_destination(cluster, &state.all_destinations, eligible, mode)?
            .ok_or_else(|| ProxyError::new(ProxyErrorKind::NoAvailableDestinations, "load balancer returned none"))
    }

    async fn forward(
        &self,
        exchange: Exchange,
        transforms: &Transforms,
        request: Request<Body>,
        cancel: CancellationToken,
    ) -> Response<Body> {
        let cluster = exchange.guard.cluster().clone();
        let destination: Arc<DestinationInfo> = (*exchange.guard).clone();
        let cluster_config = cluster.config();
        let (parts, body) = request.into_parts();

        let mut ctx = RequestTransformContext {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: QueryParams::parse(parts.uri.query()),
            headers: if transforms.copy_request_headers {
                let mut headers = parts.headers.clone();
                strip_hop_by_hop(&mut headers);
                headers.remove(header::HOST);
                headers
            } else {
                HeaderMap::new()
            },
            original_host: parts.headers.get(header::HOST).cloned(),
            client_addr: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
            path_base: parts.extensions.get::<PathBase>().map(|PathBase(base)| base.clone()),
        };
        if let Err(e) = transforms.apply_request(&mut ctx) {
            let error = ProxyError::with_source(ProxyErrorKind::RequestConstruction, "request transform failed", e);
            return self.fail_exchange(exchange, error);
        }

        let uri = match upstream_uri(&destination, &ctx) {
            Ok(uri) => uri,
            Err(e) => return self.fail_exchange(exchange, e),
        };

        let buffer_size = self.settings.stream_buffer_size;
        let request_pump_cancel = cancel.child_token();
        let (upstream_body, request_pump) = if body.is_end_stream() {
            (Body::empty(), None)
        } else {
            let (body, handle) = pipe(body_reader(body), buffer_size, request_pump_cancel.clone());
            (body, Some(handle))
        };

        let mut upstream = Request::new(upstream_body);
        *upstream.method_mut() = ctx.method;
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() = ctx.headers;
        if let Ok(value) = HeaderValue::from_str(&exchange.request_id) {
            upstream.headers_mut().insert(REQUEST_ID, value);
        }

        let timeout = cluster_config
            .request_timeout
            .unwrap_or(Duration::from_millis(self.settings.request_timeout_ms));
        let sent = tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::new(ProxyErrorKind::RequestCanceled, "request canceled by caller")),
            sent = tokio::time::timeout(timeout, self.forwarder.send(upstream)) => match sent {
                Err(_) => Err(ProxyError::new(
                    ProxyErrorKind::RequestTimeout,
                    format!("no response within {timeout:?}"),
                )),
                Ok(Err(e)) => Err(ProxyError::with_source(ProxyErrorKind::UpstreamTransport, "upstream request failed", e)),
                Ok(Ok(response)) => Ok(response),
            },
        };

        let response = match sent {
            Ok(response) => response,
            Err(error) => {
                request_pump_cancel.cancel();
                let request_outcome = match request_pump {
                    Some(handle) => join_pump(handle).await,
                    None => None,
                };
                let error = classify_send_failure(error, request_outcome.as_ref());
                if let Some(outcome) = &request_outcome {
                    self.telemetry
                        .stream_copied(&exchange.tags, StreamDirection::Request, outcome.bytes, outcome.iops);
                }
                return self.fail_exchange(exchange, error);
            }
        };

        let (mut parts, body) = response.into_parts();
        let status = parts.status;
        strip_hop_by_hop(&mut parts.headers);
        if let Err(e) = transforms.apply_response(status.is_success(), &mut parts.headers) {
            request_pump_cancel.cancel();
            let error = ProxyError::with_source(ProxyErrorKind::ResponseTransform, "response transform failed", e);
            return self.fail_exchange(exchange, error);
        }
        let eligible = cluster.dynamic_state().healthy_destinations.len();
        if let Err(e) = self.affinity.establish(
            &cluster_config.options.session_affinity,
            eligible,
            &destination,
            &mut parts.headers,
        ) {
            request_pump_cancel.cancel();
            return self.fail_exchange(exchange, e.into());
        }

        let (client_body, response_pump) = pipe(body_reader(body), buffer_size, cancel.clone());
        let coordinator = self.coordinator.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            let response_outcome = join_pump(response_pump).await;
            request_pump_cancel.cancel();
            let request_outcome = match request_pump {
                Some(handle) => join_pump(handle).await,
                None => None,
            };

            let outcome = match response_outcome.as_ref().map(|o| &o.result) {
                Some(StreamCopyResult::Success) | None => RequestOutcome::success(status),
                Some(StreamCopyResult::InputError(_)) => {
                    RequestOutcome::failure(ProxyErrorKind::ResponseBodyDestination)
                }
                Some(StreamCopyResult::OutputError(_)) => RequestOutcome::failure(ProxyErrorKind::ResponseBodyClient),
                Some(StreamCopyResult::Canceled) => RequestOutcome::failure(ProxyErrorKind::RequestCanceled),
            };
            if let Some(kind) = outcome.error {
                tracing::warn!(
                    request_id = %exchange.request_id,
                    cluster_id = %exchange.tags.cluster_id,
                    destination_id = %exchange.tags.destination_id,
                    kind = %kind,
                    "Response body copy failed"
                );
            }

            coordinator.request_proxied(exchange.guard.cluster(), &exchange.guard, &outcome);
            if let Some(o) = &request_outcome {
                telemetry.stream_copied(&exchange.tags, StreamDirection::Request, o.bytes, o.iops);
            }
            if let Some(o) = &response_outcome {
                telemetry.stream_copied(&exchange.tags, StreamDirection::Response, o.bytes, o.iops);
            }
            telemetry.request_completed(&exchange.tags, status, exchange.started.elapsed());
            tracing::debug!(
                request_id = %exchange.request_id,
                status = %status,
                latency_ms = exchange.started.elapsed().as_millis() as u64,
                "Request completed"
            );
        });

        Response::from_parts(parts, client_body)
    }

    /// Failure before a destination was chosen. Nothing to report to health.
    fn fail_early(&self, request_id: &str, route_id: &str, cluster_id: &str, error: ProxyError) -> Response<Body> {
        let status = error.status_code();
        tracing::warn!(
            request_id = %request_id,
            route_id = %route_id,
            cluster_id = %cluster_id,
            status = %status,
            error = %error,
            "Request rejected"
        );
        let tags = ProxyTags {
            cluster_id: cluster_id.to_string(),
            route_id: route_id.to_string(),
            ..Default::default()
        };
        self.telemetry.request_completed(&tags, status, Duration::ZERO);
        error_response(&error, request_id)
    }

    /// Failure after a destination was chosen, before response headers.
    fn fail_exchange(&self, exchange: Exchange, error: ProxyError) -> Response<Body> {
        let status = error.status_code();
        let source = std::error::Error::source(&error).map(ToString::to_string);
        tracing::warn!(
            request_id = %exchange.request_id,
            cluster_id = %exchange.tags.cluster_id,
            destination_id = %exchange.tags.destination_id,
            status = %status,
            error = %error,
            cause = ?source,
            "Proxying failed"
        );

        self.coordinator.request_proxied(
            exchange.guard.cluster(),
            &exchange.guard,
            &RequestOutcome::failure(error.kind),
        );
        self.telemetry
            .request_completed(&exchange.tags, status, exchange.started.elapsed());
        error_response(&error, &exchange.request_id)
    }
}

fn error_response(error: &ProxyError, request_id: &str) -> Response<Body> {
    let mut response = (error.status_code(), format!("{}\n", error.kind)).into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

/// Map a failed send to its origin using what the request body copy saw.
fn classify_send_failure(error: ProxyError, request_body: Option<&StreamCopyOutcome>) -> ProxyError {
    if error.kind != ProxyErrorKind::UpstreamTransport {
        return error;
    }
    // Nothing reached the destination when the connection never opened.
    let connect_failed = error
        .source
        .as_ref()
        .and_then(|source| source.downcast_ref::<ForwardError>())
        .is_some_and(|e| e.connect);
    if connect_failed {
        return error;
    }
    match request_body.map(|o| &o.result) {
        Some(StreamCopyResult::InputError(e)) => ProxyError::with_source(
            ProxyErrorKind::RequestBodyClient,
            "reading the request body from the client failed",
            io::Error::new(e.kind(), e.to_string()),
        ),
        Some(StreamCopyResult::OutputError(e)) => ProxyError::with_source(
            ProxyErrorKind::RequestBodyDestination,
            "sending the request body to the destination failed",
            io::Error::new(e.kind(), e.to_string()),
        ),
        _ => error,
    }
}

/// Destination base path joined with the transformed path and query.
fn upstream_uri(destination: &DestinationInfo, ctx: &RequestTransformContext) -> Result<Uri, ProxyError> {
    let mut target = destination.config().address.clone();
    let path = format!(
        "{}/{}",
        target.path().trim_end_matches('/'),
        ctx.path.trim_start_matches('/')
    );
    target.set_path(&path);
    let query = ctx.query.to_query_string();
    target.set_query((!query.is_empty()).then_some(query.as_str()));

    target.as_str().parse::<Uri>().map_err(|e| {
        ProxyError::with_source(ProxyErrorKind::RequestConstruction, "invalid upstream uri", e)
    })
}

fn body_reader(body: Body) -> impl AsyncRead + Send + Unpin + 'static {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Start copying `input` into a pipe and return the pipe's readable end as
/// a body. A failed or canceled copy ends the body with an error instead of
/// a clean EOF.
fn pipe<R>(input: R, buffer_size: usize, cancel: CancellationToken) -> (Body, JoinHandle<StreamCopyOutcome>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::duplex(buffer_size.max(1));
    let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();
    let handle = tokio::spawn(pump(input, writer, abort_tx, buffer_size, cancel));
    (piped_body(reader, abort_rx), handle)
}

async fn pump<R>(
    mut input: R,
    mut output: DuplexStream,
    abort: oneshot::Sender<io::Error>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> StreamCopyOutcome
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let outcome = stream_copier::copy(&mut input, &mut output, buffer_size, &cancel).await;
    match &outcome.result {
        StreamCopyResult::InputError(e) => {
            let _ = abort.send(io::Error::new(e.kind(), e.to_string()));
        }
        StreamCopyResult::Canceled => {
            let _ = abort.send(io::Error::new(io::ErrorKind::Interrupted, "stream copy canceled"));
        }
        StreamCopyResult::Success | StreamCopyResult::OutputError(_) => {}
    }
    drop(output);
    outcome
}

fn piped_body(reader: DuplexStream, abort: oneshot::Receiver<io::Error>) -> Body {
    let tail = stream::once(async move { abort.await.ok() })
        .filter_map(|error| async move { error.map(Err::<Bytes, io::Error>) });
    Body::from_stream(ReaderStream::new(reader).chain(tail))
}

async fn join_pump(handle: JoinHandle<StreamCopyOutcome>) -> Option<StreamCopyOutcome> {
    match handle.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!(error = %e, "Stream copy task failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Destination;
    use crate::runtime::destination::DestinationConfig;
    use axum::http::Method;

    fn destination(address: &str) -> DestinationInfo {
        DestinationInfo::new(
            "d1",
            DestinationConfig::from_options(&Destination {
                address: address.into(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn ctx(path: &str, query: Option<&str>) -> RequestTransformContext {
        RequestTransformContext {
            method: Method::GET,
            path: path.into(),
            query: QueryParams::parse(query),
            headers: HeaderMap::new(),
            original_host: None,
            client_addr: None,
            scheme: "http".into(),
            path_base: None,
        }
    }

    #[test]
    fn test_upstream_uri_joins_base_path() {
        let d = destination("http://127.0.0.1:9000/base/");
        let uri = upstream_uri(&d, &ctx("/api/items", Some("a=1&b=2"))).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/base/api/items?a=1&b=2");

        let root = destination("http://127.0.0.1:9000");
        let uri = upstream_uri(&root, &ctx("/", None)).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn test_send_failure_blames_client_body() {
        let error = ProxyError::new(ProxyErrorKind::UpstreamTransport, "connection reset");
        let outcome = StreamCopyOutcome {
            result: StreamCopyResult::InputError(io::Error::new(io::ErrorKind::UnexpectedEof, "client aborted")),
            bytes: 10,
            iops: 2,
        };
        let classified = classify_send_failure(error, Some(&outcome));
        assert_eq!(classified.kind, ProxyErrorKind::RequestBodyClient);
        assert_eq!(classified.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_send_failure_blames_destination_body() {
        let error = ProxyError::new(ProxyErrorKind::UpstreamTransport, "broken pipe");
        let outcome = StreamCopyOutcome {
            result: StreamCopyResult::OutputError(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            bytes: 0,
            iops: 1,
        };
        assert_eq!(
            classify_send_failure(error, Some(&outcome)).kind,
            ProxyErrorKind::RequestBodyDestination
        );
        let timeout = ProxyError::new(ProxyErrorKind::RequestTimeout, "slow");
        assert_eq!(classify_send_failure(timeout, Some(&outcome)).kind, ProxyErrorKind::RequestTimeout);
    }

    #[test]
    fn test_connect_failure_not_blamed_on_body() {
        let outcome = StreamCopyOutcome {
            result: StreamCopyResult::OutputError(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            bytes: 0,
            iops: 1,
        };
        let refused = ProxyError::with_source(
            ProxyErrorKind::UpstreamTransport,
            "upstream request failed",
            ForwardError::connect("connection refused"),
        );
        assert_eq!(
            classify_send_failure(refused, Some(&outcome)).kind,
            ProxyErrorKind::UpstreamTransport
        );

        let reset = ProxyError::with_source(
            ProxyErrorKind::UpstreamTransport,
            "upstream request failed",
            ForwardError::new("connection reset"),
        );
        assert_eq!(
            classify_send_failure(reset, Some(&outcome)).kind,
            ProxyErrorKind::RequestBodyDestination
        );
    }

    #[tokio::test]
    async fn test_pipe_propagates_input_failure() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            }
        }

        let (body, handle) = pipe(Broken, 64, CancellationToken::new());
        let collected = axum::body::to_bytes(body, 1024).await;
        assert!(collected.is_err());
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.result, StreamCopyResult::InputError(_)));
    }

    #[tokio::test]
    async fn test_pipe_streams_body() {
        let input: &'static [u8] = b"streamed body";
        let (body, handle) = pipe(input, 4, CancellationToken::new());
        let collected = axum::body::to_bytes(body, 1024).await.unwrap();
        assert_eq!(&collected[..], b"streamed body");
        assert_eq!(handle.await.unwrap().bytes, 13);
    }
}
