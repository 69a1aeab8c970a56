//! End-to-end dispatch tests against mock backends.

use std::sync::Arc;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::StatusCode;
use tokio_util::sync::CancellationToken;

use reverse_proxy_core::config::errors::ConfigErrorCode;
use reverse_proxy_core::config::schema::{names, RawConfig};
use reverse_proxy_core::config::source::InMemoryConfigSource;
use reverse_proxy_core::health::passive::CONSECUTIVE_FAILURES_THRESHOLD;
use reverse_proxy_core::health::state::DestinationHealth;
use reverse_proxy_core::observability::metrics::NullTelemetry;
use reverse_proxy_core::ProxyRuntime;

mod common;

async fn runtime_with(config: RawConfig) -> ProxyRuntime {
    let runtime = ProxyRuntime::builder(Arc::new(InMemoryConfigSource::new(config)))
        .telemetry(Arc::new(NullTelemetry))
        .build();
    runtime.config_manager().apply_configuration().await.unwrap();
    runtime
}

async fn send(runtime: &ProxyRuntime, path: &str) -> (StatusCode, axum::http::HeaderMap, String) {
    let route = runtime.routes().try_get("r1").unwrap();
    let response = runtime
        .dispatcher()
        .dispatch(&route, common::get(path), CancellationToken::new())
        .await;
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    (parts.status, parts.headers, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn test_request_forwarded_and_counters_return_to_zero() {
    let backend = common::start_mock_backend("hello").await;
    let runtime = runtime_with(common::single_cluster(&[("d1", backend.url())])).await;

    let (status, headers, body) = send(&runtime, "/api/items?x=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");
    assert!(headers.get("x-request-id").is_none());

    let seen = backend.last_request().unwrap();
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.target, "/api/items?x=1");
    assert!(seen.header("x-request-id").is_some());

    let cluster = runtime.clusters().try_get("c1").unwrap();
    let destination = cluster.destinations().try_get("d1").unwrap();
    assert!(common::eventually(|| cluster.concurrent_requests() == 0 && destination.concurrent_requests() == 0).await);
}

#[tokio::test]
async fn test_affinity_cookie_round_trip() {
    let a = common::start_mock_backend("a").await;
    let b = common::start_mock_backend("b").await;
    let mut config = common::single_cluster(&[("d1", a.url()), ("d2", b.url())]);
    {
        let cluster = config.clusters.get_mut("c1").unwrap();
        cluster.load_balancing.mode = Some(names::LB_ROUND_ROBIN.into());
        cluster.session_affinity.enabled = true;
    }
    let runtime = runtime_with(config).await;

    let (status, headers, first_body) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::OK);
    let set_cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap().to_string();
    assert!(set_cookie.starts_with(".Proxy.Affinity="));
    assert!(set_cookie.contains("httponly"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let route = runtime.routes().try_get("r1").unwrap();
    for _ in 0..4 {
        let mut request = common::get("/");
        request.headers_mut().insert(COOKIE, cookie.parse().unwrap());
        let response = runtime
            .dispatcher()
            .dispatch(&route, request, CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], first_body.as_bytes());
    }

    let (pinned, other) = if first_body == "a" { (&a, &b) } else { (&b, &a) };
    assert_eq!(pinned.hits(), 5);
    assert_eq!(other.hits(), 0);
}

#[tokio::test]
async fn test_passive_eviction_moves_traffic() {
    let dead = common::closed_address().await;
    let live = common::start_mock_backend("live").await;
    let mut config = common::single_cluster(&[("d1", format!("http://{dead}/")), ("d2", live.url())]);
    {
        let cluster = config.clusters.get_mut("c1").unwrap();
        cluster.load_balancing.mode = Some(names::LB_FIRST.into());
        cluster.health_check.passive.enabled = true;
        cluster.health_check.passive.policy = Some(names::PASSIVE_CONSECUTIVE_FAILURES.into());
        cluster
            .metadata
            .insert(CONSECUTIVE_FAILURES_THRESHOLD.into(), "1".into());
    }
    let runtime = runtime_with(config).await;

    let (status, _, _) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let cluster = runtime.clusters().try_get("c1").unwrap();
    let d1 = cluster.destinations().try_get("d1").unwrap();
    assert_eq!(d1.health().passive, DestinationHealth::Unhealthy);
    let healthy: Vec<_> = cluster
        .dynamic_state()
        .healthy_destinations
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    assert_eq!(healthy, vec!["d2"]);
    assert!(runtime.health_coordinator().is_reactivation_pending("c1", "d1"));

    let (status, _, body) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "live");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_active_probe_eviction() {
    let sick = common::start_programmable_backend(|request| {
        if request.target == "/health" {
            (503, "down".into())
        } else {
            (200, "sick".into())
        }
    })
    .await;
    let well = common::start_mock_backend("well").await;
    let mut config = common::single_cluster(&[("d1", sick.url()), ("d2", well.url())]);
    {
        let cluster = config.clusters.get_mut("c1").unwrap();
        cluster.load_balancing.mode = Some(names::LB_FIRST.into());
        let active = &mut cluster.health_check.active;
        active.enabled = true;
        active.interval_ms = Some(50);
        active.timeout_ms = Some(1_000);
        active.policy = Some(names::ACTIVE_STATUS_CODE.into());
        active.path = Some("/health".into());
    }
    let runtime = runtime_with(config).await;

    let cluster = runtime.clusters().try_get("c1").unwrap();
    assert!(
        common::eventually(|| {
            let state = cluster.dynamic_state();
            state.healthy_destinations.len() == 1 && state.healthy_destinations[0].id() == "d2"
        })
        .await
    );

    let d1 = cluster.destinations().try_get("d1").unwrap();
    assert_eq!(d1.health().active, DestinationHealth::Unhealthy);
    let (status, _, body) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "well");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_invalid_affinity_mode_admitted_then_fatal() {
    let backend = common::start_mock_backend("unused").await;
    let mut config = common::single_cluster(&[("d1", backend.url())]);
    {
        let cluster = config.clusters.get_mut("c1").unwrap();
        cluster.session_affinity.enabled = true;
        cluster.session_affinity.mode = Some("Bogus".into());
    }
    let runtime = ProxyRuntime::builder(Arc::new(InMemoryConfigSource::new(config)))
        .telemetry(Arc::new(NullTelemetry))
        .build();
    let report = runtime.config_manager().apply_configuration().await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id, "c1");
    assert_eq!(report.errors[0].code, ConfigErrorCode::NoSessionAffinityProviderFound);
    assert!(runtime.clusters().try_get("c1").is_some());

    let (status, _, _) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn test_unknown_load_balancing_mode_drops_cluster() {
    let backend = common::start_mock_backend("unused").await;
    let mut config = common::single_cluster(&[("d1", backend.url())]);
    config.clusters.get_mut("c1").unwrap().load_balancing.mode = Some("Bogus".into());
    let runtime = runtime_with(config).await;

    assert!(runtime.clusters().try_get("c1").is_none());
    let (status, _, _) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_no_destinations_is_service_unavailable() {
    let runtime = runtime_with(common::single_cluster(&[])).await;
    let (status, headers, _) = send(&runtime, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let backend = common::start_mock_backend("ok").await;
    let runtime = runtime_with(common::single_cluster(&[("d1", backend.url())])).await;

    let route = runtime.routes().try_get("r1").unwrap();
    let mut request = common::get("/");
    request
        .headers_mut()
        .insert("x-request-id", "req-42".parse().unwrap());
    let response = runtime
        .dispatcher()
        .dispatch(&route, request, CancellationToken::new())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();

    assert_eq!(backend.last_request().unwrap().header("x-request-id"), Some("req-42"));
}
