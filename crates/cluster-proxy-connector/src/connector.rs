//! Round-robin connection forwarding
//!
//! The pool is an `Arc` snapshot swapped under a lock, so [`RoundRobinConnector::next`]
//! always sees either the old or the new set, never a mix. The rotation
//! cursor lives outside the snapshot and survives every refresh.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cluster_proxy_common::Error;

use crate::dialer::{dial_within, EndpointDialer, TcpDialer};
use crate::readiness::Readiness;

/// How long a dial to a tunnel endpoint may take
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight relays may drain after the accept loop stops
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Minimum spacing between "no healthy endpoint" warnings
const NO_ENDPOINT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Pause after a failed accept so a full fd table does not spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A candidate tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` to dial
    pub address: String,
    /// Whether the endpoint may receive connections
    pub ready: bool,
    /// Pod behind the endpoint, for transports that address Pods by name
    pub pod: Option<String>,
}

impl Endpoint {
    /// Endpoint at `address` with the given readiness
    pub fn new(address: impl Into<String>, ready: bool) -> Self {
        Self {
            address: address.into(),
            ready,
            pod: None,
        }
    }

    /// Attach the name of the Pod serving this endpoint
    pub fn with_pod(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    /// Ready endpoint at `address`
    pub fn ready(address: impl Into<String>) -> Self {
        Self::new(address, true)
    }
}

/// Forwards local connections across a refreshable endpoint pool
pub struct RoundRobinConnector {
    pool: RwLock<Arc<Vec<Endpoint>>>,
    cursor: AtomicU64,
    readiness: Readiness,
    dialer: Arc<dyn EndpointDialer>,
    dial_timeout: Duration,
    drain_grace: Duration,
    last_empty_warning: Mutex<Option<Instant>>,
}

impl RoundRobinConnector {
    /// Connector that accepts connections only while `readiness` is set
    pub fn new(readiness: Readiness) -> Self {
        Self {
            pool: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicU64::new(0),
            readiness,
            dialer: Arc::new(TcpDialer),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            last_empty_warning: Mutex::new(None),
        }
    }

    /// Reach endpoints through `dialer` instead of plain TCP
    pub fn with_dialer(mut self, dialer: Arc<dyn EndpointDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Override the dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Override the shutdown drain grace period
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Replace the candidate set. Not-ready endpoints are dropped here.
    ///
    /// Relays already running against a removed endpoint are left alone.
    pub fn refresh(&self, endpoints: Vec<Endpoint>) {
        let candidates: Vec<Endpoint> = endpoints.into_iter().filter(|e| e.ready).collect();
        let mut pool = self.pool.write();
        if **pool != candidates {
            info!(
                endpoints = candidates.len(),
                addresses = ?candidates.iter().map(|e| e.address.as_str()).collect::<Vec<_>>(),
                "Tunnel endpoint pool updated"
            );
        }
        *pool = Arc::new(candidates);
    }

    /// Current candidate set
    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.pool.read().clone()
    }

    /// Pick the next endpoint in rotation
    pub fn next(&self) -> Result<Endpoint, Error> {
        let snapshot = self.endpoints();
        if snapshot.is_empty() {
            return Err(Error::NoHealthyEndpoint);
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot[(turn % snapshot.len() as u64) as usize].clone())
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn listen(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::internal_with_context("connector", format!("failed to bind {addr}: {e}"))
        })?;
        info!(%addr, "Local proxy listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept on `listener` until `shutdown` fires, then drain relays.
    ///
    /// Per-connection failures are logged and never end the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let relays = TaskTracker::new();
        let force_close = CancellationToken::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (inbound, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            };

            // Refuse before picking, so a refusal never uses up a turn
            if !self.readiness.is_ready() {
                debug!(%peer, "Not ready, refusing connection");
                // Zero linger turns the close into a reset
                if let Err(e) = inbound.set_linger(Some(Duration::ZERO)) {
                    debug!(%peer, error = %e, "Failed to set linger on refused connection");
                }
                drop(inbound);
                continue;
            }

            let endpoint = match self.next() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    self.warn_no_endpoint(&e);
                    continue;
                }
            };

            let connector = self.clone();
            let close = force_close.clone();
            relays.spawn(async move {
                connector.relay(inbound, peer, endpoint, close).await;
            });
        }

        drop(listener);
        relays.close();
        info!(in_flight = relays.len(), "Local proxy stopped accepting, draining");

        if tokio::time::timeout(self.drain_grace, relays.wait()).await.is_err() {
            warn!(
                remaining = relays.len(),
                grace = ?self.drain_grace,
                "Relays still open after grace period, closing"
            );
            force_close.cancel();
            relays.wait().await;
        }
    }

    async fn relay(
        &self,
        mut inbound: TcpStream,
        peer: SocketAddr,
        endpoint: Endpoint,
        close: CancellationToken,
    ) {
        let mut outbound =
            match dial_within(self.dialer.as_ref(), &endpoint, self.dial_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        %peer,
                        endpoint = %endpoint.address,
                        pod = ?endpoint.pod,
                        error = %e,
                        "Failed to dial tunnel endpoint"
                    );
                    return;
                }
            };
        let address = endpoint.address;

        debug!(%peer, endpoint = %address, "Relaying connection");
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => match result {
                Ok((from_client, from_endpoint)) => {
                    debug!(%peer, endpoint = %address, from_client, from_endpoint, "Relay finished");
                }
                Err(e) => {
                    debug!(%peer, error = %Error::transport(&address, e), "Relay ended with error");
                }
            },
            _ = close.cancelled() => {
                debug!(%peer, endpoint = %address, "Relay closed on shutdown");
            }
        }
    }

    fn warn_no_endpoint(&self, error: &Error) {
        let mut last = self.last_empty_warning.lock();
        let now = Instant::now();
        if last.map_or(true, |at| now.duration_since(at) >= NO_ENDPOINT_LOG_INTERVAL) {
            warn!(error = %error, "Dropping connection");
            *last = Some(now);
        }
    }
}
