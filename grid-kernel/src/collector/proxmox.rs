//! Proxmox VE REST client (`/api2/json`), token authentication.
//!
//! Only the three reads the collector needs: cluster nodes, QEMU guests of a
//! node, and guest-agent network interfaces.

use super::{GuestInfo, Hypervisor};
use crate::config::ProxmoxConf;
use crate::error::{GridError, GridResult};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const SOURCE: &str = "proxmox";

pub struct Proxmox {
    http: reqwest::Client,
    base: String,
    auth: String,
}

/// Toutes les réponses PVE sont enveloppées dans `{"data": ...}`
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct NodeEntry {
    node: String,
}

#[derive(Deserialize)]
struct GuestEntry {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    uptime: u64,
    #[serde(default)]
    template: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AgentInterfaces {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Deserialize)]
struct AgentInterface {
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

impl GuestEntry {
    fn into_info(self) -> GuestInfo {
        // PVE renvoie `template: 1` (parfois "1" ou true selon la version)
        let template = match &self.template {
            Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "1",
            _ => false,
        };
        GuestInfo {
            name: self.name.unwrap_or_else(|| format!("vm-{}", self.vmid)),
            vmid: self.vmid,
            running: self.status == "running",
            uptime_secs: self.uptime,
            template,
        }
    }
}

impl Proxmox {
    pub fn new(conf: &ProxmoxConf) -> GridResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(conf.insecure_tls)
            .timeout(Duration::from_secs(conf.timeout_secs.max(1)))
            .build()
            .map_err(|e| GridError::Config(format!("proxmox http client: {e}")))?;

        Ok(Self {
            http,
            base: format!("{}/api2/json", conf.url.trim_end_matches('/')),
            auth: format!("PVEAPIToken={}={}", conf.user, conf.token),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> GridResult<T> {
        let url = format!("{}{path}", self.base);
        debug!("GET {url}");

        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, &self.auth)
            .send()
            .await
            .map_err(|e| http_error(path, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GridError::collection(SOURCE, format!("{path}: {status} {}", body.trim())));
        }

        let envelope: Envelope<T> = resp.json().await.map_err(|e| http_error(path, e))?;
        Ok(envelope.data)
    }
}

fn http_error(path: &str, err: reqwest::Error) -> GridError {
    if err.is_timeout() {
        GridError::Timeout(format!("{SOURCE} {path}"))
    } else {
        GridError::collection(SOURCE, format!("{path}: {err}"))
    }
}

/// Garde les IPv4 uniquement, dans l'ordre des interfaces
fn ipv4_addresses(interfaces: AgentInterfaces) -> Vec<String> {
    interfaces
        .result
        .into_iter()
        .flat_map(|iface| iface.ip_addresses)
        .filter(|a| a.ip_address_type == "ipv4")
        .map(|a| a.ip_address)
        .collect()
}

#[async_trait]
impl Hypervisor for Proxmox {
    async fn nodes(&self) -> GridResult<Vec<String>> {
        let nodes: Vec<NodeEntry> = self.get("/nodes").await?;
        Ok(nodes.into_iter().map(|n| n.node).collect())
    }

    async fn guests(&self, node: &str) -> GridResult<Vec<GuestInfo>> {
        let guests: Vec<GuestEntry> = self.get(&format!("/nodes/{node}/qemu")).await?;
        Ok(guests.into_iter().map(GuestEntry::into_info).collect())
    }

    async fn guest_addresses(&self, node: &str, vmid: u32) -> GridResult<Vec<String>> {
        let ifaces: AgentInterfaces = self
            .get(&format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"))
            .await?;
        Ok(ipv4_addresses(ifaces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_listing_parse() {
        let json = r#"{"data":[
            {"vmid":100,"name":"alpha","status":"running","uptime":3600},
            {"vmid":9000,"name":"debian-tpl","status":"stopped","uptime":0,"template":1},
            {"vmid":101,"status":"stopped"}
        ]}"#;
        let env: Envelope<Vec<GuestEntry>> = serde_json::from_str(json).unwrap();
        let guests: Vec<GuestInfo> = env.data.into_iter().map(GuestEntry::into_info).collect();

        assert!(guests[0].running && !guests[0].template);
        assert_eq!(guests[0].uptime_secs, 3600);
        assert!(guests[1].template);
        assert_eq!(guests[2].name, "vm-101");
        assert!(!guests[2].running);
    }

    #[test]
    fn test_agent_interfaces_keep_ipv4_only() {
        let json = r#"{"data":{"result":[
            {"name":"lo","ip-addresses":[{"ip-address":"127.0.0.1","ip-address-type":"ipv4","prefix":8}]},
            {"name":"eth0","ip-addresses":[
                {"ip-address":"192.168.1.10","ip-address-type":"ipv4","prefix":24},
                {"ip-address":"fe80::1","ip-address-type":"ipv6","prefix":64}]},
            {"name":"docker0"}
        ]}}"#;
        let env: Envelope<AgentInterfaces> = serde_json::from_str(json).unwrap();
        assert_eq!(ipv4_addresses(env.data), vec!["127.0.0.1", "192.168.1.10"]);
    }

    #[test]
    fn test_token_header_and_base_url() {
        let conf = ProxmoxConf {
            url: "https://pve.lan:8006/".into(),
            user: "root@pam!grid".into(),
            token: "secret".into(),
            ..ProxmoxConf::default()
        };
        let pve = Proxmox::new(&conf).unwrap();
        assert_eq!(pve.base, "https://pve.lan:8006/api2/json");
        assert_eq!(pve.auth, "PVEAPIToken=root@pam!grid=secret");
    }
}
