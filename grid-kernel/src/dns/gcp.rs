//! Google Cloud DNS (v1 REST) provider.
//!
//! Authenticates with an OAuth access token (`gcloud auth print-access-token`
//! or a metadata-server token exported in `GRID_GCP_ACCESS_TOKEN`).
//! Cloud DNS has no record ids, so entries get a synthetic one:
//! `gcp-{managed zone}-{type}-{fqdn}`. Updates and deletes go through the
//! `changes` endpoint with the current rrset as deletion.

use super::{DnsProvider, DNS_TIMEOUT};
use crate::config::GcpConf;
use crate::error::{GridError, GridResult};
use crate::models::{DnsEntry, DnsRecord};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const NAME: &str = "gcp";
const API_BASE: &str = "https://dns.googleapis.com/dns/v1";

pub struct CloudDns {
    http: reqwest::Client,
    base: String,
    project: String,
    token: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ZonesPage {
    #[serde(default)]
    managed_zones: Vec<ManagedZone>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct ManagedZone {
    name: String,
    dns_name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RrsetsPage {
    #[serde(default)]
    rrsets: Vec<Rrset>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
struct Rrset {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    ttl: u32,
    #[serde(default)]
    rrdatas: Vec<String>,
}

#[derive(Serialize, Default)]
struct Change {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    additions: Vec<Rrset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    deletions: Vec<Rrset>,
}

impl Rrset {
    fn from_record(r: &DnsRecord) -> Self {
        Self {
            name: r.name.clone(),
            record_type: r.record_type.clone(),
            ttl: r.ttl,
            rrdatas: vec![r.content.clone()],
        }
    }

    fn into_entry(self, zone: &ManagedZone, domain: &str) -> DnsEntry {
        DnsEntry {
            id: record_id(&zone.name, &self.record_type, &self.name),
            domain: domain.to_string(),
            content: self.rrdatas.into_iter().next().unwrap_or_default(),
            record_type: self.record_type,
            name: self.name,
            ttl: self.ttl,
            provider: NAME.to_string(),
        }
    }
}

pub fn record_id(zone_name: &str, record_type: &str, fqdn: &str) -> String {
    format!("gcp-{zone_name}-{record_type}-{fqdn}")
}

impl CloudDns {
    pub fn new(conf: &GcpConf) -> GridResult<Self> {
        Self::with_base_url(conf, API_BASE)
    }

    pub fn with_base_url(conf: &GcpConf, base: &str) -> GridResult<Self> {
        if conf.access_token.is_empty() {
            return Err(GridError::Config("gcp.access_token (or GRID_GCP_ACCESS_TOKEN) is required".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(DNS_TIMEOUT)
            .build()
            .map_err(|e| GridError::Config(format!("gcp http client: {e}")))?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            project: conf.project_id.clone(),
            token: conf.access_token.clone(),
        })
    }

    fn project_url(&self, rest: &str) -> String {
        format!("{}/projects/{}{rest}", self.base, self.project)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, page_token: Option<&str>) -> GridResult<T> {
        debug!("GET {url}");
        let mut req = self.http.get(url).bearer_auth(&self.token);
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }
        decode(req.send().await.map_err(transport_error)?).await
    }

    async fn zones(&self) -> GridResult<Vec<ManagedZone>> {
        let mut zones = Vec::new();
        let mut token: Option<String> = None;
        let url = self.project_url("/managedZones");
        loop {
            let page: ZonesPage = self.get(&url, token.as_deref()).await?;
            zones.extend(page.managed_zones);
            match page.next_page_token {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }
        Ok(zones)
    }

    /// La managed zone dont le `dnsName` est `domain.`
    async fn zone_for(&self, domain: &str) -> GridResult<ManagedZone> {
        let wanted = format!("{}.", domain.trim_end_matches('.'));
        self.zones()
            .await?
            .into_iter()
            .find(|z| z.dns_name == wanted)
            .ok_or_else(|| GridError::not_found("gcp zones", domain))
    }

    async fn rrsets(&self, zone: &ManagedZone) -> GridResult<Vec<Rrset>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        let url = self.project_url(&format!("/managedZones/{}/rrsets", zone.name));
        loop {
            let page: RrsetsPage = self.get(&url, token.as_deref()).await?;
            out.extend(page.rrsets);
            match page.next_page_token {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn find_rrset(&self, zone: &ManagedZone, domain: &str, id: &str) -> GridResult<Rrset> {
        self.rrsets(zone)
            .await?
            .into_iter()
            .find(|r| record_id(&zone.name, &r.record_type, &r.name) == id)
            .ok_or_else(|| GridError::not_found(domain, id))
    }

    async fn apply(&self, zone: &ManagedZone, change: &Change) -> GridResult<()> {
        let url = self.project_url(&format!("/managedZones/{}/changes", zone.name));
        debug!("POST {url}");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(change)
            .send()
            .await
            .map_err(transport_error)?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }
}

fn transport_error(err: reqwest::Error) -> GridError {
    if err.is_timeout() {
        GridError::Timeout(format!("{NAME}: {err}"))
    } else {
        GridError::provider(NAME, err)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> GridResult<T> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(GridError::not_found(NAME, resp.url().path()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GridError::provider(NAME, format!("{status}: {}", body.trim())));
    }
    resp.json().await.map_err(|e| GridError::provider(NAME, format!("invalid response: {e}")))
}

#[async_trait]
impl DnsProvider for CloudDns {
    async fn list_entries(&self, zone: &str) -> GridResult<Vec<DnsEntry>> {
        let managed = self.zone_for(zone).await?;
        let rrsets = self.rrsets(&managed).await?;
        Ok(rrsets.into_iter().map(|r| r.into_entry(&managed, zone)).collect())
    }

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> GridResult<()> {
        let managed = self.zone_for(zone).await?;
        let change = Change { additions: vec![Rrset::from_record(record)], ..Change::default() };
        self.apply(&managed, &change).await
    }

    async fn read_record(&self, zone: &str, id: &str) -> GridResult<DnsRecord> {
        let managed = self.zone_for(zone).await?;
        let rrset = self.find_rrset(&managed, zone, id).await?;
        Ok(rrset.into_entry(&managed, zone).to_record())
    }

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> GridResult<()> {
        let managed = self.zone_for(zone).await?;
        let current = self.find_rrset(&managed, zone, id).await?;
        let change = Change { additions: vec![Rrset::from_record(record)], deletions: vec![current] };
        self.apply(&managed, &change).await
    }

    async fn delete_record(&self, zone: &str, id: &str) -> GridResult<()> {
        let managed = self.zone_for(zone).await?;
        let current = self.find_rrset(&managed, zone, id).await?;
        let change = Change { deletions: vec![current], ..Change::default() };
        self.apply(&managed, &change).await
    }

    async fn check_ip_usage(&self, ip: &str) -> GridResult<bool> {
        for zone in self.zones().await? {
            let used = self
                .rrsets(&zone)
                .await?
                .iter()
                .any(|r| r.record_type == "A" && r.rrdatas.iter().any(|d| d == ip));
            if used {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    const NEXT: &str = "CiA+b/c=";

    /// Deux pages de zones ; la seconde n'est servie que pour le jeton exact
    async fn fake_api() -> CloudDns {
        let app = Router::new().route(
            "/projects/homelab/managedZones",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(match q.get("pageToken").map(String::as_str) {
                    None => serde_json::json!({
                        "managedZones": [{"name": "lab-dev", "dnsName": "lab.dev."}],
                        "nextPageToken": NEXT
                    }),
                    Some(NEXT) => serde_json::json!({
                        "managedZones": [{"name": "home-arpa", "dnsName": "home.arpa."}]
                    }),
                    Some(_) => serde_json::json!({}),
                })
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        let conf = GcpConf { project_id: "homelab".into(), access_token: "t".into(), ..GcpConf::default() };
        CloudDns::with_base_url(&conf, &format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn test_page_token_is_query_encoded() {
        let dns = fake_api().await;
        let names: Vec<String> = dns.zones().await.unwrap().into_iter().map(|z| z.name).collect();
        assert_eq!(names, vec!["lab-dev", "home-arpa"]);
    }

    #[tokio::test]
    async fn test_upstream_404_is_not_found() {
        let dns = fake_api().await;
        let err = dns.list_entries("lab.dev").await.unwrap_err();
        assert!(matches!(err, GridError::NotFound { .. }));
    }

    fn zone() -> ManagedZone {
        ManagedZone { name: "lab-dev".into(), dns_name: "lab.dev.".into() }
    }

    #[test]
    fn test_synthetic_record_id() {
        let rrset = Rrset {
            name: "nas.lab.dev.".into(),
            record_type: "A".into(),
            ttl: 300,
            rrdatas: vec!["192.168.1.20".into(), "192.168.1.21".into()],
        };
        let entry = rrset.into_entry(&zone(), "lab.dev");
        assert_eq!(entry.id, "gcp-lab-dev-A-nas.lab.dev.");
        assert_eq!(entry.content, "192.168.1.20");
        assert_eq!(entry.provider, "gcp");
    }

    #[test]
    fn test_empty_rrdatas_gives_empty_content() {
        let rrset = Rrset { name: "x.lab.dev.".into(), record_type: "TXT".into(), ttl: 60, rrdatas: vec![] };
        assert_eq!(rrset.into_entry(&zone(), "lab.dev").content, "");
    }

    #[test]
    fn test_change_body_shape() {
        let rec = DnsRecord {
            record_type: "A".into(),
            name: "nas.lab.dev.".into(),
            content: "192.168.1.30".into(),
            ttl: 300,
            provider: None,
        };
        let change = Change { additions: vec![Rrset::from_record(&rec)], ..Change::default() };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["additions"][0]["rrdatas"][0], "192.168.1.30");
        assert!(json.get("deletions").is_none());
    }

    #[test]
    fn test_pages_parse() {
        let page: ZonesPage = serde_json::from_str(
            r#"{"managedZones":[{"name":"lab-dev","dnsName":"lab.dev.","id":"123"}],"nextPageToken":"abc"}"#,
        )
        .unwrap();
        assert_eq!(page.managed_zones[0].dns_name, "lab.dev.");
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let conf = GcpConf { project_id: "homelab".into(), ..GcpConf::default() };
        assert!(matches!(CloudDns::new(&conf), Err(GridError::Config(_))));
    }
}
