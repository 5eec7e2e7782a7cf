//! Transports to a tunnel endpoint
//!
//! Inside the hub cluster a Pod is dialed directly on `podIP:port`. From a
//! managed cluster Pod IPs are unreachable, so the connection goes through a
//! hub apiserver port-forward to the named Pod instead.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use cluster_proxy_common::Error;

use crate::connector::Endpoint;

/// A byte stream to a tunnel endpoint
pub trait Tunnel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Tunnel for T {}

/// Opens connections to endpoints chosen by the connector
#[async_trait]
pub trait EndpointDialer: Send + Sync {
    /// Connect to `endpoint`
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Tunnel>, Error>;
}

/// Dials `endpoint.address` over plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl EndpointDialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Tunnel>, Error> {
        let stream = TcpStream::connect(&endpoint.address)
            .await
            .map_err(|e| Error::transport(&endpoint.address, e))?;
        Ok(Box::new(stream))
    }
}

/// Reaches the endpoint's Pod through an apiserver port-forward
pub struct PortForwardDialer {
    api: Api<Pod>,
    port: u16,
}

impl PortForwardDialer {
    /// Forward to `port` on Pods in `namespace` of the cluster behind `client`
    pub fn new(client: Client, namespace: &str, port: u16) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            port,
        }
    }
}

#[async_trait]
impl EndpointDialer for PortForwardDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn Tunnel>, Error> {
        let pod = forward_target(endpoint)?;
        let mut forwarder = self.api.portforward(pod, &[self.port]).await?;
        let stream = forwarder.take_stream(self.port).ok_or_else(|| {
            Error::internal_with_context(
                "port-forward",
                format!("no stream for port {} on pod {pod}", self.port),
            )
        })?;

        // The forwarder pumps the websocket until the stream is dropped
        let pod = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(pod = %pod, error = %e, "Port-forward ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}

/// Pod name to port-forward to
fn forward_target(endpoint: &Endpoint) -> Result<&str, Error> {
    endpoint.pod.as_deref().ok_or_else(|| {
        Error::internal_with_context(
            "port-forward",
            format!("endpoint {} has no pod name", endpoint.address),
        )
    })
}

/// Dial with an upper bound on how long it may take
pub(crate) async fn dial_within(
    dialer: &dyn EndpointDialer,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Box<dyn Tunnel>, Error> {
    tokio::time::timeout(timeout, dialer.dial(endpoint))
        .await
        .unwrap_or_else(|_| {
            Err(Error::transport(
                &endpoint.address,
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timed out after {timeout:?}"),
                ),
            ))
        })
}
