//! Round-robin local proxy
//!
//! Accepts local TCP connections and relays each one to the next ready tunnel
//! endpoint in rotation. The endpoint set comes from periodic Pod discovery;
//! endpoints are dialed directly or through a hub port-forward.

#![deny(missing_docs)]

pub mod connector;
pub mod dialer;
pub mod discovery;
pub mod readiness;

pub use connector::{Endpoint, RoundRobinConnector};
pub use dialer::{EndpointDialer, PortForwardDialer, TcpDialer, Tunnel};
pub use discovery::{EndpointDiscovery, EndpointSource, PodEndpointSource};
pub use readiness::{readiness, Readiness, ReadinessSetter};
