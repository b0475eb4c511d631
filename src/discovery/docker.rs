use crate::discovery::ServiceSource;
use crate::error::{DockforwardError, Result};
use crate::model::{HealthStatus, Service};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

const CONTAINERS_PATH: &str = "/containers/json";

/// One entry of the daemon's container listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerRecord {
    pub names: Vec<String>,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortRecord {
    pub public_port: Option<u16>,
    pub private_port: Option<u16>,
    #[serde(rename = "Type")]
    pub kind: String,
}

impl ContainerRecord {
    /// Primary name without the leading `/`.
    pub fn name(&self) -> Option<&str> {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .filter(|n| !n.is_empty())
    }

    pub fn into_service(self) -> Option<Service> {
        let name = self.name()?.to_string();
        let exposed = self
            .ports
            .iter()
            .filter_map(|p| p.public_port)
            .filter(|p| *p != 0)
            .map(|p| p.to_string())
            .collect();
        let health = HealthStatus::from_container(&self.state, &self.status);
        Some(Service::new(name, exposed, health))
    }
}

/// Decode a `/containers/json` body into services keyed by name.
pub fn decode_containers(body: &[u8]) -> Result<BTreeMap<String, Service>> {
    let records: Vec<ContainerRecord> = serde_json::from_slice(body)
        .map_err(|e| DockforwardError::Discovery(format!("invalid container list: {}", e)))?;

    let mut services = BTreeMap::new();
    for record in records {
        match record.into_service() {
            Some(service) => {
                services.insert(service.name.clone(), service);
            }
            None => debug!("skipping container without a name"),
        }
    }
    Ok(services)
}

/// Lists containers by talking HTTP to the Docker daemon's Unix socket on the
/// remote host, tunneled through the transport.
pub struct DockerDiscovery {
    transport: Arc<dyn Transport>,
    socket_path: String,
}

impl DockerDiscovery {
    pub fn new(transport: Arc<dyn Transport>, socket_path: impl Into<String>) -> Self {
        Self {
            transport,
            socket_path: socket_path.into(),
        }
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let stream = self.transport.open_socket(&self.socket_path).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| DockforwardError::Discovery(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%e, "docker connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| DockforwardError::Discovery(format!("invalid request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DockforwardError::Discovery(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DockforwardError::Discovery(format!(
                "GET {} returned {}",
                path, status
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DockforwardError::Discovery(format!("failed to read body: {}", e)))?
            .to_bytes();
        Ok(body)
    }
}

#[async_trait]
impl ServiceSource for DockerDiscovery {
    #[instrument(skip(self), fields(socket = %self.socket_path))]
    async fn list_services(&self) -> Result<BTreeMap<String, Service>> {
        let body = self.get(CONTAINERS_PATH).await?;
        let services = decode_containers(&body)?;
        debug!(count = services.len(), "listed remote containers");
        Ok(services)
    }
}
