//! Provider dispatch and IP usage fan-out, directly and through the REST API.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use grid_devkit::{MockDnsProvider, TestHarness};
use grid_kernel::dns::ProviderRegistry;
use grid_kernel::error::GridError;
use grid_kernel::http::{build_router, AppState};
use grid_kernel::models::DnsRecord;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn record(name: &str, ip: &str) -> DnsRecord {
    DnsRecord { record_type: "A".into(), name: name.into(), content: ip.into(), ttl: 300, provider: None }
}

struct Providers {
    gcp: Arc<MockDnsProvider>,
    cloudflare: Arc<MockDnsProvider>,
    registry: ProviderRegistry,
}

/// gcp puis cloudflare (défaut), comme le câblage depuis la config
fn providers() -> Providers {
    let gcp = Arc::new(MockDnsProvider::new("gcp"));
    let cloudflare = Arc::new(MockDnsProvider::new("cloudflare"));
    let mut registry = ProviderRegistry::new();
    registry.register("gcp", gcp.clone(), false);
    registry.register("cloudflare", cloudflare.clone(), true);
    Providers { gcp, cloudflare, registry }
}

#[tokio::test]
async fn omitted_provider_goes_to_default() {
    let p = providers();
    p.registry.create_record(None, "lab.dev", &record("nas.lab.dev", "192.168.1.20")).await.unwrap();

    assert_eq!(p.cloudflare.record_count(), 1);
    assert_eq!(p.gcp.calls(), 0);

    p.registry.list_entries(Some("gcp"), "lab.dev").await.unwrap();
    assert_eq!(p.gcp.calls(), 1);
}

#[tokio::test]
async fn unregistered_provider_is_rejected_before_any_call() {
    let p = providers();
    let err = p.registry.list_entries(Some("azure"), "lab.dev").await.unwrap_err();

    assert!(matches!(err, GridError::InvalidProvider(ref name) if name == "azure"));
    assert_eq!(p.gcp.calls() + p.cloudflare.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn ip_usage_answers_on_first_positive() {
    let fast_negative = Arc::new(MockDnsProvider::new("a"));
    let positive = Arc::new(MockDnsProvider::new("b").using_ip("192.168.1.50").with_delay(Duration::from_millis(50)));
    let slow = Arc::new(MockDnsProvider::new("c").with_delay(Duration::from_secs(60)));

    let mut registry = ProviderRegistry::new();
    registry.register("a", fast_negative.clone(), false);
    registry.register("b", positive.clone(), false);
    registry.register("c", slow.clone(), false);

    let started = tokio::time::Instant::now();
    assert!(registry.check_ip_usage("192.168.1.50").await.unwrap());

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(slow.calls(), 1);
    assert_eq!(slow.ip_checks_finished(), 0);
}

#[tokio::test]
async fn ip_usage_reports_error_only_without_positive() {
    let mut registry = ProviderRegistry::new();
    registry.register("a", Arc::new(MockDnsProvider::new("a").failing("rate limited")), false);
    registry.register("b", Arc::new(MockDnsProvider::new("b")), false);
    assert!(matches!(registry.check_ip_usage("10.0.0.9").await, Err(GridError::Provider { .. })));

    registry.register("c", Arc::new(MockDnsProvider::new("c").using_ip("10.0.0.9")), false);
    assert!(registry.check_ip_usage("10.0.0.9").await.unwrap());
}

async fn call(app: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn api(registry: ProviderRegistry) -> axum::Router {
    build_router(AppState::new(TestHarness::alpha_beta().context(), registry))
}

#[tokio::test]
async fn api_maps_unknown_provider_to_400() {
    let p = providers();
    let req = Request::get("/api/v1/dns/lab.dev/entries?provider=azure").body(Body::empty()).unwrap();
    let (status, body) = call(api(p.registry), req).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_provider");
}

#[tokio::test]
async fn api_record_lifecycle_on_default_provider() {
    let p = providers();
    let app = api(p.registry.clone());

    let create = Request::post("/api/v1/dns/lab.dev/records")
        .header("content-type", "application/json")
        .body(Body::from(json!({"type": "A", "name": "nas.lab.dev", "content": "192.168.1.20", "ttl": 300}).to_string()))
        .unwrap();
    let (status, body) = call(app.clone(), create).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"], "Record created successfully");

    let (status, body) = call(app.clone(), Request::get("/api/v1/dns/lab.dev/entries").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["provider"], "cloudflare");
    let id = body[0]["id"].as_str().unwrap().to_string();

    let delete = Request::delete(format!("/api/v1/dns/lab.dev/records/{id}")).body(Body::empty()).unwrap();
    assert_eq!(call(app.clone(), delete).await.0, StatusCode::OK);

    let read = Request::get(format!("/api/v1/dns/lab.dev/records/{id}")).body(Body::empty()).unwrap();
    assert_eq!(call(app, read).await.0, StatusCode::NOT_FOUND);
    assert_eq!(p.gcp.calls(), 0);
}

#[tokio::test]
async fn api_body_provider_wins_over_query() {
    let p = providers();
    let create = Request::post("/api/v1/dns/lab.dev/records?provider=cloudflare")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"type": "A", "name": "vpn.lab.dev", "content": "192.168.1.1", "ttl": 60, "provider": "gcp"}).to_string(),
        ))
        .unwrap();
    let (status, _) = call(api(p.registry), create).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(p.gcp.record_count(), 1);
    assert_eq!(p.cloudflare.record_count(), 0);
}

#[tokio::test]
async fn api_ip_usage_message() {
    let mut registry = ProviderRegistry::new();
    registry.register("cloudflare", Arc::new(MockDnsProvider::new("cloudflare").using_ip("192.168.1.20")), true);
    let app = api(registry);

    let (_, body) = call(app.clone(), Request::get("/api/v1/dns/ip/192.168.1.20").body(Body::empty()).unwrap()).await;
    assert_eq!(body, json!({"in_use": true, "message": "IP is in use"}));

    let (_, body) = call(app.clone(), Request::get("/api/v1/dns/ip/192.168.1.99").body(Body::empty()).unwrap()).await;
    assert_eq!(body["message"], "IP is not in use");

    let (status, _) = call(app, Request::get("/api/v1/dns/ip/not-an-ip").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
