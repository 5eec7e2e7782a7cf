//! Common types for cluster-proxy: errors, well-known names, backoff and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Credential Secrets
// =============================================================================

/// Namespace holding the signed credential Secrets and the proxy-server pods
pub const PROXY_NAMESPACE: &str = "cluster-proxy";

/// Secret holding the agent-facing server certificate and key
pub const AGENT_SERVER_SECRET: &str = "agent-server";

/// Secret holding the proxy-facing server certificate and key
pub const PROXY_SERVER_SECRET: &str = "proxy-server";

/// Secret holding the CA that signed the proxy certificates
pub const PROXY_SERVER_CA_SECRET: &str = "proxy-server-ca";

/// Directory the proxy-server and proxy-server-ca bundles are written to
pub const PROXY_SECRETS_DIR: &str = "/.ocm/cluster-proxy/proxy";

/// Directory the agent-server bundle is written to
pub const AGENT_SECRETS_DIR: &str = "/.ocm/cluster-proxy/agent";

/// Key of the CA certificate inside a credential bundle
pub const CA_CERT_KEY: &str = "ca.crt";

/// Key of the leaf certificate inside a credential bundle
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Key of the private key inside a credential bundle
pub const TLS_KEY_KEY: &str = "tls.key";

// =============================================================================
// Tunnel Server
// =============================================================================

/// Port the tunnel server accepts proxied (frontend) connections on
pub const DEFAULT_TUNNEL_SERVER_PORT: u16 = 8090;

/// Port the tunnel server accepts agent connections on
pub const DEFAULT_TUNNEL_AGENT_PORT: u16 = 8091;

/// Routing strategy handed to the tunnel server
pub const DEFAULT_PROXY_STRATEGY: &str = "destHost";

/// Number of tunnel server replicas agents should expect
pub const DEFAULT_SERVER_COUNT: u32 = 1;

// =============================================================================
// Local Proxy
// =============================================================================

/// Port the round-robin local proxy listens on
pub const DEFAULT_LOCAL_PROXY_PORT: u16 = 8091;

/// Label key identifying cluster-proxy components
pub const LABEL_COMPONENT_NAME: &str = "proxy.open-cluster-management.io/component-name";

/// Component name of the tunnel server pods
pub const COMPONENT_PROXY_SERVER: &str = "proxy-server";

/// Label selector matching tunnel server pods
pub fn proxy_server_selector() -> String {
    format!("{}={}", LABEL_COMPONENT_NAME, COMPONENT_PROXY_SERVER)
}

// =============================================================================
// Watch
// =============================================================================

/// Watcher timeout (seconds), kept below the client read timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_proxy_server_component() {
        assert_eq!(
            proxy_server_selector(),
            "proxy.open-cluster-management.io/component-name=proxy-server"
        );
    }

    #[test]
    fn agent_and_proxy_dirs_differ() {
        assert_ne!(AGENT_SECRETS_DIR, PROXY_SECRETS_DIR);
    }
}
