//! Modèle d'entités Grid : hôtes (VMs), workloads (conteneurs) et enregistrements DNS.
//!
//! Les formes JSON des hôtes et workloads sont celles stockées dans le cache KV.
//! Les noms de champs suivent l'API Docker Engine (`Id`, `Names`, `Ports`...) pour que
//! la réponse de `/containers/json` se désérialise telle quelle.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Une VM de la flotte, telle que collectée depuis l'hyperviseur
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostRecord {
    pub name: String,
    #[serde(rename = "IP", default)]
    pub ip: Vec<String>,
    pub uptime: Uptime,
    pub running: bool,
}

impl HostRecord {
    pub fn new(name: impl Into<String>, running: bool, uptime_secs: u64, ip: Vec<String>) -> Self {
        Self { name: name.into(), ip, uptime: Uptime::from_secs(uptime_secs), running }
    }
}

/// Uptime décomposé pour l'affichage. `raw` (secondes) est la seule source de vérité :
/// à la désérialisation les autres champs sont toujours recalculés.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", from = "RawUptime")]
pub struct Uptime {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    pub raw: u64,
}

#[derive(Deserialize)]
struct RawUptime {
    #[serde(rename = "Raw", default)]
    raw: u64,
}

impl From<RawUptime> for Uptime {
    fn from(value: RawUptime) -> Self {
        Uptime::from_secs(value.raw)
    }
}

impl Uptime {
    pub fn from_secs(raw: u64) -> Self {
        Self {
            seconds: raw % 60,
            minutes: (raw / 60) % 60,
            hours: (raw / 3600) % 24,
            // jours modulo 30, comme l'affichage du tableau de bord
            days: (raw / 86400) % 30,
            raw,
        }
    }

    /// Rendu compact pour les tableaux : plus grande unité non nulle
    pub fn short(&self) -> String {
        if self.days > 0 {
            format!("{} days", self.days)
        } else if self.hours > 0 {
            format!("{} h", self.hours)
        } else if self.minutes > 0 {
            format!("{} min", self.minutes)
        } else {
            format!("{} s", self.seconds)
        }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} days, {} h, {} ', {} ''", self.days, self.hours, self.minutes, self.seconds)
    }
}

/// Un conteneur tournant sur un hôte
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkloadRecord {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Timestamp unix de création
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "PrivatePort")]
    pub private_port: u16,
    #[serde(rename = "PublicPort", default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    pub protocol: String,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.ip.as_deref().unwrap_or(""),
            self.public_port.unwrap_or(0),
            self.private_port,
            self.protocol
        )
    }
}

impl WorkloadRecord {
    /// Identifiant tronqué à 12 caractères (forme courte docker)
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(12) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    /// Premier alias sans le '/' de tête
    pub fn display_name(&self) -> &str {
        self.names.first().map(|n| n.trim_start_matches('/')).unwrap_or("")
    }

    /// Âge en jours entiers, recalculé à chaque lecture (jamais stocké)
    pub fn age_days(&self, now: OffsetDateTime) -> i64 {
        match OffsetDateTime::from_unix_timestamp(self.created) {
            Ok(created) => (now - created).whole_days().max(0),
            Err(_) => 0,
        }
    }

    pub fn ports_label(&self) -> String {
        self.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
    }
}

/// Forme uniforme d'un enregistrement DNS, quel que soit le backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Entrée de listing DNS ; `id` est l'identifiant natif du backend, opaque
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub id: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub provider: String,
}

impl DnsEntry {
    pub fn to_record(&self) -> DnsRecord {
        DnsRecord {
            record_type: self.record_type.clone(),
            name: self.name.clone(),
            content: self.content.clone(),
            ttl: self.ttl,
            provider: Some(self.provider.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_uptime_decomposition() {
        let up = Uptime::from_secs(2 * 86400 + 3 * 3600 + 4 * 60 + 5);
        assert_eq!((up.days, up.hours, up.minutes, up.seconds), (2, 3, 4, 5));
        assert_eq!(up.short(), "2 days");
        assert_eq!(up.to_string(), "2 days, 3 h, 4 ', 5 ''");
        assert_eq!(Uptime::from_secs(59).short(), "59 s");
        assert_eq!(Uptime::from_secs(3600).short(), "1 h");
    }

    #[test]
    fn test_uptime_derived_fields_ignored_on_read() {
        let json = r#"{"Name":"alpha","IP":["192.168.1.10"],"Uptime":{"Seconds":999,"Minutes":999,"Hours":0,"Days":0,"Raw":61},"Running":true}"#;
        let host: HostRecord = serde_json::from_str(json).unwrap();
        assert_eq!(host.uptime.raw, 61);
        assert_eq!(host.uptime.minutes, 1);
        assert_eq!(host.uptime.seconds, 1);
    }

    #[test]
    fn test_workload_from_docker_payload() {
        let json = r#"{
            "Id": "8dfafdbc3a40a2c3b2a1f0e9d8c7b6a5",
            "Names": ["/traefik", "/proxy"],
            "Image": "traefik:v3",
            "Created": 1700000000,
            "Ports": [{"IP": "0.0.0.0", "PrivatePort": 80, "PublicPort": 8080, "Type": "tcp"},
                      {"PrivatePort": 443, "Type": "tcp"}],
            "State": "running"
        }"#;
        let w: WorkloadRecord = serde_json::from_str(json).unwrap();
        assert_eq!(w.short_id(), "8dfafdbc3a40");
        assert_eq!(w.display_name(), "traefik");
        assert_eq!(w.ports_label(), "0.0.0.0:8080->80/tcp, :0->443/tcp");
    }

    #[test]
    fn test_age_recomputed_from_now() {
        let w = WorkloadRecord {
            id: "abc".into(),
            names: vec![],
            image: "nginx".into(),
            ports: vec![],
            created: datetime!(2024-01-01 00:00 UTC).unix_timestamp(),
        };
        assert_eq!(w.age_days(datetime!(2024-01-11 12:00 UTC)), 10);
        assert_eq!(w.age_days(datetime!(2024-03-01 00:00 UTC)), 60);
        assert_eq!(w.short_id(), "abc");
        assert_eq!(w.display_name(), "");
    }
}
