use crate::error::{GridError, GridResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GridConfig {
    pub proxmox: ProxmoxConf,
    pub nats: NatsConf,
    pub api: ApiConf,
    pub ssh: SshConf,
    pub sync: SyncConf,
    pub network: NetworkConf,
    pub cloudflare: Option<CloudflareConf>,
    pub gcp: Option<GcpConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxmoxConf {
    pub url: String,
    /// ex: "root@pam!grid" (token id complet)
    pub user: String,
    pub token: String,
    /// certificats auto-signés du homelab
    pub insecure_tls: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NatsConf {
    pub url: String,
    pub user: String,
    pub password: String,
    /// identifiant de flotte, préfixe des buckets `<bucket>-vms` / `<bucket>-containers`
    pub bucket: String,
    pub replicas: usize,
    pub ttl_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub user: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConf {
    /// écrit le résultat d'une collecte on-demand dans le cache
    pub enabled: bool,
    pub concurrency: usize,
    pub host_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConf {
    pub private_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CloudflareConf {
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GcpConf {
    pub project_id: String,
    /// jeton OAuth (ex: `gcloud auth print-access-token`)
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub is_default: bool,
}

impl Default for ProxmoxConf {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006".into(),
            user: String::new(),
            token: String::new(),
            insecure_tls: true,
            timeout_secs: 5,
        }
    }
}

impl Default for NatsConf {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".into(),
            user: "nats".into(),
            password: String::new(),
            bucket: "i2".into(),
            replicas: 1,
            ttl_secs: 30 * 60,
            timeout_secs: 2,
        }
    }
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self { user: "root".into(), connect_timeout_secs: 5 }
    }
}

impl Default for SyncConf {
    fn default() -> Self {
        Self { enabled: true, concurrency: 4, host_timeout_secs: 10 }
    }
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self { private_prefix: "192.168".into() }
    }
}

impl NatsConf {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        // 0 = non configuré, on retombe sur 2s
        Duration::from_secs(if self.timeout_secs == 0 { 2 } else { self.timeout_secs })
    }
}

impl GridConfig {
    pub fn parse(txt: &str) -> GridResult<Self> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|e| GridError::Config(e.to_string()))
    }

    pub fn to_yaml(&self) -> GridResult<String> {
        serde_yaml::to_string(self).map_err(|e| GridError::Config(e.to_string()))
    }

    /// Les secrets peuvent venir de l'environnement (.env compris) plutôt que du YAML
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GRID_NATS_PASSWORD") {
            self.nats.password = v;
        }
        if let Ok(v) = std::env::var("GRID_PROXMOX_TOKEN") {
            self.proxmox.token = v;
        }
        if let Ok(v) = std::env::var("GRID_CLOUDFLARE_TOKEN") {
            self.cloudflare.get_or_insert_with(CloudflareConf::default).api_token = v;
        }
        if let Ok(v) = std::env::var("GRID_GCP_ACCESS_TOKEN") {
            if let Some(gcp) = self.gcp.as_mut() {
                gcp.access_token = v;
            }
        }
    }
}

/// `--config`, sinon `GRID_CONFIG`, sinon `grid.yaml`
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var("GRID_CONFIG").unwrap_or_else(|_| "grid.yaml".into()).into(),
    }
}

/// Charge la config. Fichier absent = config par défaut ; fichier invalide = erreur.
pub async fn load_config(explicit: Option<&Path>) -> GridResult<GridConfig> {
    let path = config_path(explicit);

    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|e| GridError::Config(format!("{}: {e}", path.display())))?;
        let cfg = GridConfig::parse(&txt)?;
        info!("loaded config from {}", path.display());
        cfg
    } else {
        warn!("no config at {}, using defaults", path.display());
        GridConfig::default()
    };

    cfg.apply_env_overrides();
    Ok(cfg)
}

/// Écrit la config par défaut ; un fichier existant n'est remplacé qu'avec `force`
pub async fn write_default_config(path: &Path, force: bool) -> GridResult<()> {
    if path.exists() && !force {
        return Err(GridError::Config(format!("{} already exists (use --force to overwrite)", path.display())));
    }
    let yaml = GridConfig::default().to_yaml()?;
    fs::write(path, yaml)
        .await
        .map_err(|e| GridError::Config(format!("{}: {e}", path.display())))?;
    info!("wrote default config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GridConfig::default();
        assert_eq!(cfg.nats.bucket, "i2");
        assert_eq!(cfg.nats.ttl(), Duration::from_secs(1800));
        assert_eq!(cfg.network.private_prefix, "192.168");
        assert_eq!(cfg.api.port, 8080);
        assert!(cfg.cloudflare.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = GridConfig::parse(
            "nats:\n  url: nats://nas:4222\n  bucket: lab\n  timeout_secs: 0\ncloudflare:\n  api_token: abc\n  is_default: true\n",
        )
        .unwrap();
        assert_eq!(cfg.nats.url, "nats://nas:4222");
        assert_eq!(cfg.nats.bucket, "lab");
        assert_eq!(cfg.nats.replicas, 1);
        assert_eq!(cfg.nats.timeout(), Duration::from_secs(2));
        assert!(cfg.cloudflare.unwrap().is_default);
        assert_eq!(cfg.sync.concurrency, 4);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(matches!(GridConfig::parse("nats: [1, 2"), Err(GridError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let cfg = load_config(Some(Path::new("/nonexistent/grid.yaml"))).await.unwrap();
        assert_eq!(cfg.ssh.connect_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_init_writes_loadable_defaults_once() {
        let path = std::env::temp_dir().join(format!("grid-init-{}.yaml", std::process::id()));
        let _ = std::fs::remove_file(&path);

        write_default_config(&path, false).await.unwrap();
        let cfg = load_config(Some(&path)).await.unwrap();
        assert_eq!(cfg.nats.bucket, "i2");
        assert_eq!(cfg.api.port, 8080);

        assert!(matches!(write_default_config(&path, false).await, Err(GridError::Config(_))));
        write_default_config(&path, true).await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
