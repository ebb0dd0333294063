/**
 * API REST GRID - Serveur HTTP du coeur
 *
 * RÔLE :
 * Expose l'inventaire de la flotte (VMs, conteneurs, sync forcée) et le CRUD
 * DNS multi-provider pour les scripts et dashboards du homelab.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, toutes les routes métier sous /api/v1, /health et
 *   /healtz/ready à la racine
 * - État explicite (AppState) : contexte de flotte + registre DNS, aucun global
 * - GridError → ApiError : statut HTTP + corps {"code", "message"} stables
 *   (provider inconnu = 400, hôte inconnu = 404, cache HS = 503, timeout = 504)
 * - Middleware de trace : méthode, chemin, statut, durée
 *
 * ROUTES :
 * - GET    /api/v1/dns/{zone}/entries?provider=
 * - POST   /api/v1/dns/{zone}/records
 * - GET|PUT|DELETE /api/v1/dns/{zone}/records/{id}?provider=
 * - GET    /api/v1/dns/ip/{ip}
 * - GET    /api/v1/fleet/vms · POST /api/v1/fleet/sync · GET /api/v1/fleet/containers
 * - GET    /api/v1/fleet/hosts/{host}/containers
 * - GET    /api/v1/proxmox/nodes · GET /api/v1/proxmox/vms (live, hors cache)
 */

use crate::dns::ProviderRegistry;
use crate::error::GridError;
use crate::models::{DnsEntry, DnsRecord, HostRecord, WorkloadRecord};
use crate::sync::{FleetContext, FleetReport, FleetTotals, HostListing, SyncMode, SyncOutcome};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub fleet: FleetContext,
    pub dns: Arc<ProviderRegistry>,
    /// Résumé de la dernière sync forcée passée par l'API
    pub last_sync: Arc<Mutex<Option<SyncSummary>>>,
}

impl AppState {
    pub fn new(fleet: FleetContext, dns: ProviderRegistry) -> Self {
        Self { fleet, dns: Arc::new(dns), last_sync: Arc::new(Mutex::new(None)) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub at: String,
    pub outcome: SyncOutcome,
    pub totals: FleetTotals,
}

/// Corps d'erreur commun à toutes les routes
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody { code: "bad_request".into(), message: message.into() },
        }
    }
}

impl From<GridError> for ApiError {
    fn from(err: GridError) -> Self {
        let status = match &err {
            GridError::InvalidProvider(_) => StatusCode::BAD_REQUEST,
            GridError::HostUnknown(_) | GridError::NotFound { .. } => StatusCode::NOT_FOUND,
            GridError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GridError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GridError::Provider { .. } | GridError::CollectionFailed { .. } => StatusCode::BAD_GATEWAY,
            GridError::Corrupt { .. } | GridError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {err}");
        }
        Self { status, body: ErrorBody { code: err.code().into(), message: err.to_string() } }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ProviderQuery {
    provider: Option<String>,
}

/// Rapport de flotte + verdict global
#[derive(Serialize)]
struct FleetView<'a> {
    outcome: SyncOutcome,
    #[serde(flatten)]
    report: &'a FleetReport,
}

#[derive(Serialize)]
struct HostContainers {
    host: String,
    address: String,
    workloads: Vec<WorkloadRecord>,
}

async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let resp = next.run(req).await;
    let status = resp.status();
    if status.is_server_error() {
        warn!("{method} {path} -> {} ({:?})", status.as_u16(), started.elapsed());
    } else {
        info!("{method} {path} -> {} ({:?})", status.as_u16(), started.elapsed());
    }
    resp
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healtz/ready", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/api/v1", get(api_info))
        .route("/api/v1/", get(api_info))
        .route("/api/v1/dns/{zone}/entries", get(list_entries))
        .route("/api/v1/dns/{zone}/records", axum::routing::post(create_record))
        .route(
            "/api/v1/dns/{zone}/records/{id}",
            get(read_record).put(update_record).delete(delete_record),
        )
        .route("/api/v1/dns/ip/{ip}", get(check_ip_usage))
        .route("/api/v1/fleet/vms", get(fleet_vms))
        .route("/api/v1/fleet/sync", axum::routing::post(fleet_sync))
        .route("/api/v1/fleet/containers", get(fleet_containers))
        .route("/api/v1/fleet/hosts/{host}/containers", get(host_containers))
        .route("/api/v1/proxmox/nodes", get(proxmox_nodes))
        .route("/api/v1/proxmox/vms", get(proxmox_vms))
        .with_state(app_state)
        .layer(middleware::from_fn(trace_requests))
}

/// Sert l'API jusqu'à ce que `shutdown` se résolve (arrêt gracieux)
pub async fn serve<F>(app_state: AppState, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, build_router(app_state)).with_graceful_shutdown(shutdown).await
}

// GET /api/v1 (version, providers, dernière sync)
async fn api_info(State(app): State<AppState>) -> Json<serde_json::Value> {
    let last_sync = app.last_sync.lock().clone();
    Json(json!({
        "name": "grid",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": app.fleet.store().backend_name(),
        "dns_providers": app.dns.names(),
        "default_provider": app.dns.default_name(),
        "last_sync": last_sync,
    }))
}

// GET /dns/{zone}/entries
async fn list_entries(
    State(app): State<AppState>,
    Path(zone): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> ApiResult<Json<Vec<DnsEntry>>> {
    Ok(Json(app.dns.list_entries(q.provider.as_deref(), &zone).await?))
}

// POST /dns/{zone}/records (provider : corps, sinon query, sinon défaut)
async fn create_record(
    State(app): State<AppState>,
    Path(zone): Path<String>,
    Query(q): Query<ProviderQuery>,
    body: Result<Json<DnsRecord>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(record) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let provider = record.provider.as_deref().or(q.provider.as_deref());
    app.dns.create_record(provider, &zone, &record).await?;
    Ok((StatusCode::CREATED, Json(json!({ "message": "Record created successfully" }))))
}

// GET /dns/{zone}/records/{id}
async fn read_record(
    State(app): State<AppState>,
    Path((zone, id)): Path<(String, String)>,
    Query(q): Query<ProviderQuery>,
) -> ApiResult<Json<DnsRecord>> {
    Ok(Json(app.dns.read_record(q.provider.as_deref(), &zone, &id).await?))
}

// PUT /dns/{zone}/records/{id}
async fn update_record(
    State(app): State<AppState>,
    Path((zone, id)): Path<(String, String)>,
    Query(q): Query<ProviderQuery>,
    body: Result<Json<DnsRecord>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(record) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let provider = record.provider.as_deref().or(q.provider.as_deref());
    app.dns.update_record(provider, &zone, &id, &record).await?;
    Ok(Json(json!({ "message": "Record updated successfully" })))
}

// DELETE /dns/{zone}/records/{id}
async fn delete_record(
    State(app): State<AppState>,
    Path((zone, id)): Path<(String, String)>,
    Query(q): Query<ProviderQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    app.dns.delete_record(q.provider.as_deref(), &zone, &id).await?;
    Ok(Json(json!({ "message": "Record deleted successfully" })))
}

// GET /dns/ip/{ip} (tous les providers)
async fn check_ip_usage(
    State(app): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if ip.parse::<IpAddr>().is_err() {
        return Err(ApiError::bad_request(format!("invalid ip address: {ip}")));
    }
    let in_use = app.dns.check_ip_usage(&ip).await?;
    let message = if in_use { "IP is in use" } else { "IP is not in use" };
    Ok(Json(json!({ "in_use": in_use, "message": message })))
}

// GET /fleet/vms (cache d'abord)
async fn fleet_vms(State(app): State<AppState>) -> ApiResult<Json<HostListing>> {
    Ok(Json(app.fleet.hosts(SyncMode::OnDemand).await?))
}

// POST /fleet/sync (collecte live + réécriture du cache)
async fn fleet_sync(State(app): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let report = app.fleet.force_sync().await?;
    let summary = SyncSummary {
        at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        outcome: report.outcome(),
        totals: report.totals,
    };
    *app.last_sync.lock() = Some(summary);
    Ok(Json(fleet_json(&report)))
}

// GET /fleet/containers (rapport complet, cache d'abord)
async fn fleet_containers(State(app): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let report = app.fleet.fleet(SyncMode::OnDemand).await?;
    Ok(Json(fleet_json(&report)))
}

// GET /fleet/hosts/{host}/containers (live)
async fn host_containers(
    State(app): State<AppState>,
    Path(host): Path<String>,
) -> ApiResult<Json<HostContainers>> {
    let (address, workloads) = app.fleet.containers(&host).await?;
    Ok(Json(HostContainers { host, address, workloads }))
}

// GET /proxmox/nodes
async fn proxmox_nodes(State(app): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(app.fleet.nodes().await?))
}

// GET /proxmox/vms
async fn proxmox_vms(State(app): State<AppState>) -> ApiResult<Json<Vec<HostRecord>>> {
    Ok(Json(app.fleet.live_hosts().await?))
}

fn fleet_json(report: &FleetReport) -> serde_json::Value {
    serde_json::to_value(FleetView { outcome: report.outcome(), report }).unwrap_or_else(|e| {
        error!("fleet report serialization failed: {e}");
        json!({ "code": "internal", "message": "report serialization failed" })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{ContainerRuntime, GuestInfo, Hypervisor, InventoryCollector, RuntimeAccess, RuntimeConnector};
    use crate::dns::DnsProvider;
    use crate::error::GridResult;
    use crate::store::MemoryStore;
    use crate::sync::SyncSettings;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl Hypervisor for Offline {
        async fn nodes(&self) -> GridResult<Vec<String>> {
            Err(GridError::collection("proxmox", "connection refused"))
        }
        async fn guests(&self, _node: &str) -> GridResult<Vec<GuestInfo>> {
            Ok(vec![])
        }
        async fn guest_addresses(&self, _node: &str, _vmid: u32) -> GridResult<Vec<String>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl RuntimeConnector for Offline {
        async fn connect(&self, access: &RuntimeAccess) -> GridResult<Box<dyn ContainerRuntime>> {
            Err(GridError::collection(&access.to_string(), "unreachable"))
        }
    }

    /// Répond avec son propre nom dans `content`
    struct Named(&'static str);

    #[async_trait]
    impl DnsProvider for Named {
        async fn list_entries(&self, zone: &str) -> GridResult<Vec<DnsEntry>> {
            Ok(vec![DnsEntry {
                id: "1".into(),
                domain: zone.into(),
                record_type: "A".into(),
                name: "nas".into(),
                content: "192.168.1.20".into(),
                ttl: 300,
                provider: self.0.into(),
            }])
        }
        async fn create_record(&self, _zone: &str, _record: &DnsRecord) -> GridResult<()> {
            Ok(())
        }
        async fn read_record(&self, zone: &str, id: &str) -> GridResult<DnsRecord> {
            Err(GridError::not_found(zone, id))
        }
        async fn update_record(&self, _zone: &str, _id: &str, _record: &DnsRecord) -> GridResult<()> {
            Ok(())
        }
        async fn delete_record(&self, _zone: &str, _id: &str) -> GridResult<()> {
            Ok(())
        }
        async fn check_ip_usage(&self, ip: &str) -> GridResult<bool> {
            Ok(ip == "192.168.1.20")
        }
    }

    fn app() -> Router {
        let collector = InventoryCollector::new(Arc::new(Offline), Arc::new(Offline));
        let store = Arc::new(MemoryStore::new(Default::default()));
        let fleet = FleetContext::new(store, "lab", "192.168", collector, SyncSettings::default());

        let mut dns = ProviderRegistry::new();
        dns.register("gcp", Arc::new(Named("gcp")), false);
        dns.register("cloudflare", Arc::new(Named("cloudflare")), true);
        build_router(AppState::new(fleet, dns))
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = HttpRequest::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder.header("content-type", "application/json").body(Body::from(b.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_is_outside_api_prefix() {
        let resp = app()
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_and_proxmox_errors() {
        let (status, body) = call(app(), "GET", "/healtz/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app(), "GET", "/api/v1/proxmox/nodes", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "collection_failed");
    }

    #[tokio::test]
    async fn test_default_provider_used_without_param() {
        let (status, body) = call(app(), "GET", "/api/v1/dns/lab.dev/entries", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["provider"], "cloudflare");

        let (_, body) = call(app(), "GET", "/api/v1/dns/lab.dev/entries?provider=gcp", None).await;
        assert_eq!(body[0]["provider"], "gcp");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_bad_request() {
        let (status, body) = call(app(), "GET", "/api/v1/dns/lab.dev/entries?provider=azure", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_provider");

        let record = json!({"type": "A", "name": "nas", "content": "192.168.1.20", "ttl": 300, "provider": "azure"});
        let (status, _) = call(app(), "POST", "/api/v1/dns/lab.dev/records", Some(record)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_and_malformed_body() {
        let record = json!({"type": "A", "name": "nas", "content": "192.168.1.20", "ttl": 300});
        let (status, body) = call(app(), "POST", "/api/v1/dns/lab.dev/records", Some(record)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"], "Record created successfully");

        let (status, body) = call(app(), "POST", "/api/v1/dns/lab.dev/records", Some(json!({"name": 3}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let (status, _) = call(app(), "GET", "/api/v1/dns/lab.dev/records/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ip_usage_route() {
        let (status, body) = call(app(), "GET", "/api/v1/dns/ip/192.168.1.20", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"in_use": true, "message": "IP is in use"}));

        let (_, body) = call(app(), "GET", "/api/v1/dns/ip/10.1.1.1", None).await;
        assert_eq!(body["message"], "IP is not in use");

        let (status, _) = call(app(), "GET", "/api/v1/dns/ip/not-an-ip", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fleet_errors_map_to_status() {
        // cache vide + hyperviseur injoignable
        let (status, body) = call(app(), "GET", "/api/v1/fleet/vms", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "collection_failed");

        let (status, body) = call(app(), "GET", "/api/v1/fleet/hosts/ghost/containers", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "host_unknown");
    }

    #[tokio::test]
    async fn test_api_info_lists_providers() {
        let (status, body) = call(app(), "GET", "/api/v1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dns_providers"], json!(["cloudflare", "gcp"]));
        assert_eq!(body["default_provider"], "cloudflare");
        assert_eq!(body["cache"], "memory");
        assert!(body["last_sync"].is_null());
    }
}
