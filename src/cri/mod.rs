//! Container runtime access: the CRI client and the container -> pod -> domain
//! inventory built from it.
//!
//! - `api`: `runtime.v1` messages and the gRPC client
//! - `transport`: endpoint parsing and channel setup
//! - `inventory`: the refreshable lookup tables used to resolve PIDs to pods

pub mod api;
pub mod inventory;
pub mod transport;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::instrument;

pub use inventory::{
    InventoryOptions, ResolveError, RuntimeInventory, Tables, DEFAULT_DOMAIN_ANNOTATION,
};
pub use transport::{connect_channel, RuntimeEndpoint};

use api::{
    ContainerFilter, ContainerState, ContainerStateValue, ListContainersRequest,
    ListPodSandboxRequest, PodSandboxFilter, PodSandboxState, PodSandboxStateValue,
    RuntimeServiceClient,
};

/// Errors raised while talking to the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid container runtime endpoint `{endpoint}`")]
    InvalidEndpoint { endpoint: String },
    #[error("failed to connect to container runtime at `{endpoint}`: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("timed out after {timeout:?} connecting to container runtime at `{endpoint}`")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("{method} failed: {source}")]
    Rpc {
        method: &'static str,
        #[source]
        source: tonic::Status,
    },
    #[error("{method} timed out after {timeout:?}")]
    RpcTimeout {
        method: &'static str,
        timeout: Duration,
    },
}

/// A running container and the sandbox it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub pod_sandbox_id: String,
}

/// A ready pod sandbox. `name` is empty when the runtime reported no
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SandboxRef {
    pub id: String,
    pub name: String,
    pub annotations: HashMap<String, String>,
}

/// The two listing calls the inventory needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Containers currently in the running state.
    async fn list_running_containers(&self) -> Result<Vec<ContainerRef>, RuntimeError>;

    /// Pod sandboxes currently in the ready state.
    async fn list_ready_sandboxes(&self) -> Result<Vec<SandboxRef>, RuntimeError>;
}

/// [`RuntimeClient`] backed by a CRI gRPC connection.
#[derive(Debug, Clone)]
pub struct GrpcRuntimeClient {
    client: RuntimeServiceClient,
    request_timeout: Duration,
}

impl GrpcRuntimeClient {
    pub fn new(channel: Channel, request_timeout: Duration) -> Self {
        Self {
            client: RuntimeServiceClient::new(channel),
            request_timeout,
        }
    }

    /// Connects to `endpoint`, bounded by `connect_timeout`.
    pub async fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let channel = connect_channel(endpoint, connect_timeout).await?;
        Ok(Self::new(channel, request_timeout))
    }
}

#[async_trait]
impl RuntimeClient for GrpcRuntimeClient {
    #[instrument(skip(self))]
    async fn list_running_containers(&self) -> Result<Vec<ContainerRef>, RuntimeError> {
        const METHOD: &str = "ListContainers";
        let request = ListContainersRequest {
            filter: Some(ContainerFilter {
                state: Some(ContainerStateValue {
                    state: ContainerState::ContainerRunning as i32,
                }),
                ..Default::default()
            }),
        };

        let mut client = self.client.clone();
        let response = tokio::time::timeout(self.request_timeout, client.list_containers(request))
            .await
            .map_err(|_| RuntimeError::RpcTimeout {
                method: METHOD,
                timeout: self.request_timeout,
            })?
            .map_err(|source| RuntimeError::Rpc {
                method: METHOD,
                source,
            })?;

        Ok(response
            .into_inner()
            .containers
            .into_iter()
            .map(|c| ContainerRef {
                id: c.id,
                pod_sandbox_id: c.pod_sandbox_id,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_ready_sandboxes(&self) -> Result<Vec<SandboxRef>, RuntimeError> {
        const METHOD: &str = "ListPodSandbox";
        let request = ListPodSandboxRequest {
            filter: Some(PodSandboxFilter {
                state: Some(PodSandboxStateValue {
                    state: PodSandboxState::SandboxReady as i32,
                }),
                ..Default::default()
            }),
        };

        let mut client = self.client.clone();
        let response = tokio::time::timeout(self.request_timeout, client.list_pod_sandbox(request))
            .await
            .map_err(|_| RuntimeError::RpcTimeout {
                method: METHOD,
                timeout: self.request_timeout,
            })?
            .map_err(|source| RuntimeError::Rpc {
                method: METHOD,
                source,
            })?;

        Ok(response
            .into_inner()
            .items
            .into_iter()
            .map(|s| SandboxRef {
                id: s.id,
                name: s.metadata.map(|m| m.name).unwrap_or_default(),
                annotations: s.annotations,
            })
            .collect())
    }
}
