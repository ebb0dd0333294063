//! Docker Engine access through `bollard`.
//!
//! - local: the daemon socket (`/var/run/docker.sock`)
//! - http:  an engine exposed on `tcp://host:2375` / `http://host:2375`
//! - ssh:   `ssh -N -L <tmp socket>:/var/run/docker.sock user@host`, then the
//!   forwarded socket is used like a local one
//!
//! The tunnel process is spawned with `kill_on_drop` and its socket file is
//! removed when the session goes away, closed or not.

use super::{ContainerRuntime, RuntimeAccess, RuntimeConnector};
use crate::config::SshConf;
use crate::error::{GridError, GridResult};
use crate::models::{PortMapping, WorkloadRecord};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, Port};
use bollard::{Docker, API_DEFAULT_VERSION};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::debug;

pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

static TUNNELS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct DockerConnector {
    socket: String,
    ssh_connect_timeout: Duration,
    request_timeout: Duration,
}

impl DockerConnector {
    pub fn new(ssh: &SshConf, request_timeout: Duration) -> Self {
        Self {
            socket: DOCKER_SOCKET.to_string(),
            ssh_connect_timeout: Duration::from_secs(ssh.connect_timeout_secs.max(1)),
            request_timeout,
        }
    }

    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = socket.into();
        self
    }

    fn engine_on_socket(&self, label: &str, path: &str) -> GridResult<Docker> {
        Docker::connect_with_socket(path, self.request_timeout.as_secs().max(1), API_DEFAULT_VERSION)
            .map_err(|e| GridError::collection(label, format!("docker socket {path}: {e}")))
    }
}

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self, access: &RuntimeAccess) -> GridResult<Box<dyn ContainerRuntime>> {
        let label = access.to_string();
        let (docker, tunnel) = match access {
            RuntimeAccess::Local => {
                if tokio::fs::metadata(&self.socket).await.is_err() {
                    return Err(GridError::collection("local", format!("no docker socket at {}", self.socket)));
                }
                (self.engine_on_socket(&label, &self.socket)?, None)
            }
            RuntimeAccess::Http(base) => {
                let docker = Docker::connect_with_http(base, self.request_timeout.as_secs().max(1), API_DEFAULT_VERSION)
                    .map_err(|e| GridError::collection(&label, format!("docker engine {base}: {e}")))?;
                (docker, None)
            }
            RuntimeAccess::Ssh(target) => {
                let tunnel = SshTunnel::open(target, &self.socket, self.ssh_connect_timeout).await?;
                let local = tunnel.local.to_string_lossy().into_owned();
                (self.engine_on_socket(&label, &local)?, Some(tunnel))
            }
        };

        Ok(Box::new(DockerSession {
            docker: Mutex::new(Some(docker)),
            tunnel: Mutex::new(tunnel),
            access: access.clone(),
            timeout: self.request_timeout,
        }))
    }
}

/// Socket docker distant exposé localement via `ssh -L`
struct SshTunnel {
    child: Child,
    local: PathBuf,
}

/// Arguments ssh (sans le programme) pour forwarder `remote` sur `local`
pub fn tunnel_args(target: &str, local: &Path, remote: &str, connect_timeout: Duration) -> Vec<String> {
    vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".into(),
        "ExitOnForwardFailure=yes".into(),
        "-N".into(),
        "-L".into(),
        format!("{}:{remote}", local.display()),
        target.to_string(),
    ]
}

impl SshTunnel {
    async fn open(target: &str, remote: &str, connect_timeout: Duration) -> GridResult<Self> {
        let local = std::env::temp_dir().join(format!(
            "grid-{}-{}.sock",
            std::process::id(),
            TUNNELS.fetch_add(1, Ordering::Relaxed)
        ));
        debug!("opening ssh tunnel to {target} on {}", local.display());

        let child = Command::new("ssh")
            .args(tunnel_args(target, &local, remote, connect_timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GridError::collection(target, format!("spawn ssh: {e}")))?;
        let mut tunnel = SshTunnel { child, local };

        // ssh ne signale pas la mise en place du forward : on attend la socket
        let deadline = Instant::now() + connect_timeout + Duration::from_secs(1);
        loop {
            if tokio::fs::metadata(&tunnel.local).await.is_ok() {
                return Ok(tunnel);
            }
            if let Some(status) = tunnel.child.try_wait().map_err(|e| GridError::collection(target, e))? {
                let mut stderr = String::new();
                if let Some(mut pipe) = tunnel.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(GridError::collection(target, format!("ssh exited ({status}): {}", stderr.trim())));
            }
            if Instant::now() >= deadline {
                return Err(GridError::Timeout(format!("ssh tunnel to {target} after {connect_timeout:?}")));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        let _ = std::fs::remove_file(&self.local);
    }
}

pub struct DockerSession {
    docker: Mutex<Option<Docker>>,
    tunnel: Mutex<Option<SshTunnel>>,
    access: RuntimeAccess,
    timeout: Duration,
}

#[async_trait]
impl ContainerRuntime for DockerSession {
    async fn list_workloads(&self) -> GridResult<Vec<WorkloadRecord>> {
        let Some(docker) = self.docker.lock().clone() else {
            return Err(GridError::collection(&self.access.to_string(), "session closed"));
        };
        debug!("listing containers on {}", self.access);

        let options = ListContainersOptions::<String> { all: false, ..Default::default() };
        let summaries = tokio::time::timeout(self.timeout, docker.list_containers(Some(options)))
            .await
            .map_err(|_| GridError::Timeout(format!("container listing on {} after {:?}", self.access, self.timeout)))?
            .map_err(|e| GridError::collection(&self.access.to_string(), e))?;

        Ok(summaries.into_iter().map(workload_from_summary).collect())
    }

    async fn close(&self) {
        let engine = self.docker.lock().take();
        let tunnel = self.tunnel.lock().take();
        if engine.is_some() {
            debug!("closed docker session {}", self.access);
        }
        drop(tunnel);
    }
}

/// Entrée de `/containers/json` vers le record mis en cache
pub fn workload_from_summary(summary: ContainerSummary) -> WorkloadRecord {
    WorkloadRecord {
        id: summary.id.unwrap_or_default(),
        names: summary.names.unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        ports: summary.ports.unwrap_or_default().into_iter().map(port_mapping).collect(),
        created: summary.created.unwrap_or_default(),
    }
}

fn port_mapping(port: Port) -> PortMapping {
    PortMapping {
        ip: port.ip.filter(|ip| !ip.is_empty()),
        private_port: port.private_port,
        public_port: port.public_port,
        protocol: port.typ.map(|t| t.to_string()).unwrap_or_default(),
    }
}
