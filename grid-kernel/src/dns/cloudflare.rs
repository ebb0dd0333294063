//! Cloudflare DNS over the v4 REST API (bearer API token).
//!
//! Zones are addressed by name in the public API and resolved to Cloudflare
//! zone ids on each call. Record ids are Cloudflare's own and are passed
//! through unchanged.

use super::{DnsProvider, DNS_TIMEOUT};
use crate::config::CloudflareConf;
use crate::error::{GridError, GridResult};
use crate::models::{DnsEntry, DnsRecord};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const NAME: &str = "cloudflare";
const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const PAGE_SIZE: u32 = 100;

pub struct Cloudflare {
    http: reqwest::Client,
    base: String,
    token: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Deserialize)]
struct Zone {
    id: String,
}

#[derive(Deserialize)]
struct CfRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    #[serde(default)]
    ttl: u32,
}

#[derive(Serialize)]
struct CfRecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

impl<'a> From<&'a DnsRecord> for CfRecordBody<'a> {
    fn from(r: &'a DnsRecord) -> Self {
        // ttl 1 = "automatic" côté Cloudflare
        Self { record_type: &r.record_type, name: &r.name, content: &r.content, ttl: r.ttl.max(1) }
    }
}

impl CfRecord {
    fn into_entry(self, zone: &str) -> DnsEntry {
        DnsEntry {
            id: self.id,
            domain: zone.to_string(),
            record_type: self.record_type,
            name: self.name,
            content: self.content,
            ttl: self.ttl,
            provider: NAME.to_string(),
        }
    }
}

impl Cloudflare {
    pub fn new(conf: &CloudflareConf) -> GridResult<Self> {
        Self::with_base_url(conf, API_BASE)
    }

    pub fn with_base_url(conf: &CloudflareConf, base: &str) -> GridResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DNS_TIMEOUT)
            .build()
            .map_err(|e| GridError::Config(format!("cloudflare http client: {e}")))?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string(), token: conf.api_token.clone() })
    }

    /// Appel brut : renvoie `result` et la pagination, ou l'erreur de l'API
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&CfRecordBody<'_>>,
    ) -> GridResult<(Option<T>, Option<ResultInfo>)> {
        let url = format!("{}{path}", self.base);
        debug!("{method} {url}");

        let mut req = self.http.request(method, &url).bearer_auth(&self.token).query(query);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| transport_error(path, e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GridError::not_found(NAME, path));
        }

        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| GridError::provider(NAME, format!("{path}: {status}: {e}")))?;
        if !parsed.success || !status.is_success() {
            let detail = parsed
                .errors
                .iter()
                .map(|m| format!("{} ({})", m.message, m.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GridError::provider(NAME, format!("{path}: {status}: {detail}")));
        }
        Ok((parsed.result, parsed.result_info))
    }

    /// Toutes les pages d'un listing (`per_page` max)
    async fn list_all<T: DeserializeOwned>(&self, path: &str, filters: &[(&str, String)]) -> GridResult<Vec<T>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let mut query = filters.to_vec();
            query.push(("per_page", PAGE_SIZE.to_string()));
            query.push(("page", page.to_string()));
            let (items, info) = self.call::<Vec<T>>(Method::GET, path, &query, None).await?;
            out.extend(items.unwrap_or_default());
            match info {
                Some(i) if i.page < i.total_pages => page = i.page + 1,
                _ => break,
            }
        }
        Ok(out)
    }

    async fn zone_id(&self, zone: &str) -> GridResult<String> {
        let zones: Vec<Zone> = self.list_all("/zones", &[("name", zone.to_string())]).await?;
        zones
            .into_iter()
            .next()
            .map(|z| z.id)
            .ok_or_else(|| GridError::not_found("cloudflare zones", zone))
    }
}

fn transport_error(path: &str, err: reqwest::Error) -> GridError {
    if err.is_timeout() {
        GridError::Timeout(format!("{NAME} {path}"))
    } else {
        GridError::provider(NAME, format!("{path}: {err}"))
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    async fn list_entries(&self, zone: &str) -> GridResult<Vec<DnsEntry>> {
        let zid = self.zone_id(zone).await?;
        let records: Vec<CfRecord> = self.list_all(&format!("/zones/{zid}/dns_records"), &[]).await?;
        Ok(records.into_iter().map(|r| r.into_entry(zone)).collect())
    }

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> GridResult<()> {
        let zid = self.zone_id(zone).await?;
        self.call::<CfRecord>(Method::POST, &format!("/zones/{zid}/dns_records"), &[], Some(&record.into()))
            .await?;
        Ok(())
    }

    async fn read_record(&self, zone: &str, id: &str) -> GridResult<DnsRecord> {
        let zid = self.zone_id(zone).await?;
        let (rec, _) = self.call::<CfRecord>(Method::GET, &format!("/zones/{zid}/dns_records/{id}"), &[], None).await?;
        let rec = rec.ok_or_else(|| GridError::not_found(zone, id))?;
        Ok(rec.into_entry(zone).to_record())
    }

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> GridResult<()> {
        let zid = self.zone_id(zone).await?;
        self.call::<CfRecord>(Method::PUT, &format!("/zones/{zid}/dns_records/{id}"), &[], Some(&record.into()))
            .await?;
        Ok(())
    }

    async fn delete_record(&self, zone: &str, id: &str) -> GridResult<()> {
        let zid = self.zone_id(zone).await?;
        self.call::<serde_json::Value>(Method::DELETE, &format!("/zones/{zid}/dns_records/{id}"), &[], None)
            .await?;
        Ok(())
    }

    async fn check_ip_usage(&self, ip: &str) -> GridResult<bool> {
        let zones: Vec<Zone> = self.list_all("/zones", &[]).await?;
        let filters = [("type", "A".to_string()), ("content", ip.to_string())];
        for zone in zones {
            let hits: Vec<CfRecord> = self.list_all(&format!("/zones/{}/dns_records", zone.id), &filters).await?;
            if hits.iter().any(|r| r.content == ip) {
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

    /// API Cloudflare locale : /zones renvoie une zone dont l'id est le `name` reçu
    async fn fake_api() -> Cloudflare {
        let app = Router::new().route(
            "/zones",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let name = q.get("name").cloned().unwrap_or_default();
                Json(serde_json::json!({
                    "success": true,
                    "errors": [],
                    "result": [{"id": name}],
                    "result_info": {"page": 1, "total_pages": 1}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Cloudflare::with_base_url(&CloudflareConf::default(), &format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn test_zone_name_is_query_encoded() {
        let cf = fake_api().await;
        assert_eq!(cf.zone_id("r&d.lab.dev").await.unwrap(), "r&d.lab.dev");
    }

    #[tokio::test]
    async fn test_upstream_404_is_not_found() {
        let cf = fake_api().await;
        let err = cf.read_record("lab.dev", "missing").await.unwrap_err();
        assert!(matches!(err, GridError::NotFound { .. }));
    }

    #[test]
    fn test_api_error_envelope() {
        let json = r#"{"success":false,"errors":[{"code":9109,"message":"Invalid access token"}],"result":null}"#;
        let parsed: ApiResponse<Vec<Zone>> = serde_json::from_str(json).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.errors[0].code, 9109);
        assert!(parsed.result.is_none());
    }

    #[test]
    fn test_record_listing_to_entries() {
        let json = r#"{"success":true,"errors":[],"result":[
            {"id":"372e67954025e0ba6aaa6d586b9e0b59","type":"A","name":"nas.lab.dev","content":"192.168.1.20","ttl":1,"proxied":false}
        ],"result_info":{"page":1,"per_page":100,"total_pages":1,"count":1}}"#;
        let parsed: ApiResponse<Vec<CfRecord>> = serde_json::from_str(json).unwrap();
        let info = parsed.result_info.unwrap();
        assert_eq!((info.page, info.total_pages), (1, 1));

        let entry = parsed.result.unwrap().remove(0).into_entry("lab.dev");
        assert_eq!(entry.id, "372e67954025e0ba6aaa6d586b9e0b59");
        assert_eq!(entry.provider, "cloudflare");
        assert_eq!(entry.to_record().content, "192.168.1.20");
    }

    #[test]
    fn test_body_uses_automatic_ttl_for_zero() {
        let rec = DnsRecord {
            record_type: "A".into(),
            name: "nas".into(),
            content: "192.168.1.20".into(),
            ttl: 0,
            provider: Some("cloudflare".into()),
        };
        let body = serde_json::to_value(CfRecordBody::from(&rec)).unwrap();
        assert_eq!(body["ttl"], 1);
        assert_eq!(body["type"], "A");
        assert!(body.get("provider").is_none());
    }
}
