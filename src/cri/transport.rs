//! Channel setup for the container runtime endpoint.
//!
//! Runtimes normally listen on a unix socket; tonic only speaks to URIs, so
//! unix endpoints are dialled through a custom connector and the URI handed
//! to tonic is a placeholder.

use std::path::PathBuf;
use std::time::Duration;
use std::{pin, task};

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::cri::RuntimeError;

/// Where the runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    Unix(PathBuf),
    Http(String),
}

impl RuntimeEndpoint {
    /// Parses `unix:///path`, a bare absolute path, `tcp://host:port` or an
    /// `http(s)://` URI.
    pub fn parse(endpoint: &str) -> Result<Self, RuntimeError> {
        let endpoint = endpoint.trim();
        let invalid = || RuntimeError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        };

        if let Some(path) = endpoint.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(invalid());
            }
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(path)));
        }
        if endpoint.starts_with('/') {
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(endpoint)));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(invalid());
            }
            return Ok(RuntimeEndpoint::Http(format!("http://{}", addr)));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(RuntimeEndpoint::Http(endpoint.to_string()));
        }
        Err(invalid())
    }
}

#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future = pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// Dials the runtime endpoint, giving up after `connect_timeout`.
pub async fn connect_channel(
    endpoint: &str,
    connect_timeout: Duration,
) -> Result<Channel, RuntimeError> {
    debug!("Connecting to container runtime at {}", endpoint);

    let connect = match RuntimeEndpoint::parse(endpoint)? {
        RuntimeEndpoint::Unix(path) => {
            let ep = Endpoint::from_static("http://[::]:50051").connect_timeout(connect_timeout);
            tokio::time::timeout(connect_timeout, ep.connect_with_connector(UnixConnector { path }))
                .await
        }
        RuntimeEndpoint::Http(uri) => {
            let ep = Endpoint::from_shared(uri)
                .map_err(|_| RuntimeError::InvalidEndpoint {
                    endpoint: endpoint.to_string(),
                })?
                .connect_timeout(connect_timeout);
            tokio::time::timeout(connect_timeout, ep.connect()).await
        }
    };

    let channel = connect
        .map_err(|_| RuntimeError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout: connect_timeout,
        })?
        .map_err(|source| RuntimeError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;

    debug!("Connected to container runtime at {}", endpoint);
    Ok(channel)
}
