//! Tunnel endpoint discovery
//!
//! Lists the tunnel server Pods by label and feeds their addresses to the
//! connector on an interval. Readiness flips on after the first successful
//! listing so the local proxy never accepts before it knows where to send
//! traffic.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use cluster_proxy_common::Error;

use crate::connector::{Endpoint, RoundRobinConnector};
use crate::readiness::ReadinessSetter;

/// How often the endpoint set is re-listed
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Where candidate endpoints come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Current endpoints with their readiness
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, Error>;
}

/// Endpoints backed by label-selected Pods
pub struct PodEndpointSource {
    api: Api<Pod>,
    selector: String,
    port: u16,
}

impl PodEndpointSource {
    /// Pods in `namespace` matching `selector`, dialed on `port`
    pub fn new(client: Client, namespace: &str, selector: impl Into<String>, port: u16) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            selector: selector.into(),
            port,
        }
    }
}

#[async_trait]
impl EndpointSource for PodEndpointSource {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let pods = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        Ok(pods
            .items
            .iter()
            .filter_map(|pod| endpoint_from_pod(pod, self.port))
            .collect())
    }
}

/// Endpoint for a Pod, or `None` if it has no usable IP yet.
///
/// The Pod name rides along for port-forward dialing.
pub fn endpoint_from_pod(pod: &Pod, port: u16) -> Option<Endpoint> {
    let status = pod.status.as_ref()?;
    let ip: IpAddr = status.pod_ip.as_deref()?.parse().ok()?;
    let ready = status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let endpoint = Endpoint::new(SocketAddr::new(ip, port).to_string(), ready);
    Some(match pod.metadata.name.as_deref() {
        Some(name) => endpoint.with_pod(name),
        None => endpoint,
    })
}

/// Periodically refreshes a connector from an [`EndpointSource`]
pub struct EndpointDiscovery {
    source: Arc<dyn EndpointSource>,
    connector: Arc<RoundRobinConnector>,
    interval: Duration,
}

impl EndpointDiscovery {
    /// Discovery feeding `connector` every [`DEFAULT_REFRESH_INTERVAL`]
    pub fn new(source: Arc<dyn EndpointSource>, connector: Arc<RoundRobinConnector>) -> Self {
        Self {
            source,
            connector,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Override the refresh interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// List once and swap the result into the connector
    pub async fn refresh_once(&self) -> Result<usize, Error> {
        let endpoints = self.source.list_endpoints().await?;
        let total = endpoints.len();
        self.connector.refresh(endpoints);
        let ready = self.connector.endpoints().len();
        debug!(total, ready, "Refreshed tunnel endpoints");
        Ok(ready)
    }

    /// Refresh on every tick until `shutdown` fires.
    ///
    /// A failed listing keeps the previous pool.
    pub async fn run(self, readiness: ReadinessSetter, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut announced = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.refresh_once().await {
                Ok(ready) => {
                    if !announced {
                        info!(ready, "Initial endpoint discovery complete, accepting connections");
                        readiness.set(true);
                        announced = true;
                    }
                }
                Err(e) => warn!(error = %e, "Endpoint discovery failed, keeping previous pool"),
            }
        }
        debug!("Endpoint discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    use super::*;
    use crate::readiness::readiness;

    fn pod(ip: Option<&str>, ready: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_pod_becomes_ready_endpoint() {
        let endpoint = endpoint_from_pod(&pod(Some("10.1.2.3"), "True"), 8091).unwrap();
        assert_eq!(endpoint, Endpoint::ready("10.1.2.3:8091"));
    }

    #[test]
    fn named_pod_endpoint_carries_its_name() {
        let mut named = pod(Some("10.1.2.3"), "True");
        named.metadata.name = Some("proxy-server-7f9c".to_string());

        let endpoint = endpoint_from_pod(&named, 8091).unwrap();
        assert_eq!(endpoint.pod.as_deref(), Some("proxy-server-7f9c"));
        assert_eq!(endpoint.address, "10.1.2.3:8091");
    }

    #[test]
    fn unready_pod_is_listed_but_not_ready() {
        let endpoint = endpoint_from_pod(&pod(Some("10.1.2.3"), "False"), 8091).unwrap();
        assert!(!endpoint.ready);
    }

    #[test]
    fn pod_without_ip_is_skipped() {
        assert_eq!(endpoint_from_pod(&pod(None, "True"), 8091), None);
        assert_eq!(endpoint_from_pod(&Pod::default(), 8091), None);
    }

    #[test]
    fn ipv6_address_is_bracketed() {
        let endpoint = endpoint_from_pod(&pod(Some("fd00::1"), "True"), 8091).unwrap();
        assert_eq!(endpoint.address, "[fd00::1]:8091");
    }

    #[tokio::test]
    async fn refresh_feeds_only_ready_endpoints() {
        let mut source = MockEndpointSource::new();
        source.expect_list_endpoints().returning(|| {
            Ok(vec![
                Endpoint::ready("10.0.0.1:8091"),
                Endpoint::new("10.0.0.2:8091", false),
            ])
        });
        let (_setter, reader) = readiness();
        let connector = Arc::new(RoundRobinConnector::new(reader));
        let discovery = EndpointDiscovery::new(Arc::new(source), connector.clone());

        assert_eq!(discovery.refresh_once().await.unwrap(), 1);
        assert_eq!(connector.next().unwrap().address, "10.0.0.1:8091");
    }

    #[tokio::test]
    async fn readiness_waits_for_first_successful_refresh() {
        let mut source = MockEndpointSource::new();
        let mut calls = 0;
        source.expect_list_endpoints().returning(move || {
            calls += 1;
            if calls == 1 {
                Err(Error::internal("apiserver unreachable"))
            } else {
                Ok(vec![Endpoint::ready("10.0.0.1:8091")])
            }
        });

        let (setter, mut reader) = readiness();
        let connector = Arc::new(RoundRobinConnector::new(reader.clone()));
        let discovery = EndpointDiscovery::new(Arc::new(source), connector.clone())
            .with_interval(Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(discovery.run(setter, shutdown.clone()));

        assert!(tokio::time::timeout(Duration::from_secs(2), reader.wait_ready())
            .await
            .unwrap());
        assert_eq!(connector.endpoints().len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
