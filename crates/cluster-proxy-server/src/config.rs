//! Tunnel server configuration derived from materialized credentials

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use cluster_proxy_common::{
    AGENT_SECRETS_DIR, CA_CERT_KEY, DEFAULT_PROXY_STRATEGY, DEFAULT_SERVER_COUNT,
    DEFAULT_TUNNEL_AGENT_PORT, DEFAULT_TUNNEL_SERVER_PORT, PROXY_SECRETS_DIR, TLS_CERT_KEY,
    TLS_KEY_KEY,
};

use crate::bundle::BundleRole;

/// Where credentials land on disk and how the tunnel server is exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Directory for the proxy-server and proxy-server-ca bundles
    pub proxy_dir: PathBuf,
    /// Directory for the agent-server bundle
    pub agent_dir: PathBuf,
    /// Address proxied clients connect to
    pub listen_addr: SocketAddr,
    /// Address tunnel agents connect to
    pub agent_addr: SocketAddr,
    /// Routing strategy string passed through to the engine
    pub proxy_strategies: String,
    /// Replica count advertised to agents
    pub server_count: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            proxy_dir: PathBuf::from(PROXY_SECRETS_DIR),
            agent_dir: PathBuf::from(AGENT_SECRETS_DIR),
            listen_addr: SocketAddr::new(any, DEFAULT_TUNNEL_SERVER_PORT),
            agent_addr: SocketAddr::new(any, DEFAULT_TUNNEL_AGENT_PORT),
            proxy_strategies: DEFAULT_PROXY_STRATEGY.to_string(),
            server_count: DEFAULT_SERVER_COUNT,
        }
    }
}

impl ServerSettings {
    /// Directory a bundle of the given role is materialized into
    pub fn dir_for(&self, role: BundleRole) -> &Path {
        match role {
            BundleRole::AgentServer => &self.agent_dir,
            BundleRole::ProxyServer | BundleRole::ProxyServerCA => &self.proxy_dir,
        }
    }
}

/// Everything the tunnel engine needs to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelServerConfig {
    /// Address proxied clients connect to
    pub listen_addr: SocketAddr,
    /// Address tunnel agents connect to
    pub agent_addr: SocketAddr,
    /// CA used to verify agents
    pub cluster_ca_cert: PathBuf,
    /// Certificate presented to agents
    pub cluster_cert: PathBuf,
    /// Key for `cluster_cert`
    pub cluster_key: PathBuf,
    /// CA used to verify proxied clients
    pub server_ca_cert: PathBuf,
    /// Certificate presented to proxied clients
    pub server_cert: PathBuf,
    /// Key for `server_cert`
    pub server_key: PathBuf,
    /// Routing strategy string
    pub proxy_strategies: String,
    /// Replica count advertised to agents
    pub server_count: u32,
}

impl TunnelServerConfig {
    /// Derive the engine configuration from where the bundles were written
    pub fn from_settings(settings: &ServerSettings) -> Self {
        let proxy = &settings.proxy_dir;
        let agent = &settings.agent_dir;
        Self {
            listen_addr: settings.listen_addr,
            agent_addr: settings.agent_addr,
            cluster_ca_cert: proxy.join(CA_CERT_KEY),
            cluster_cert: proxy.join(TLS_CERT_KEY),
            cluster_key: proxy.join(TLS_KEY_KEY),
            server_ca_cert: proxy.join(CA_CERT_KEY),
            server_cert: agent.join(TLS_CERT_KEY),
            server_key: agent.join(TLS_KEY_KEY),
            proxy_strategies: settings.proxy_strategies.clone(),
            server_count: settings.server_count,
        }
    }

    /// The six certificate and key paths, in flag order
    pub fn cert_paths(&self) -> [&Path; 6] {
        [
            &self.cluster_ca_cert,
            &self.cluster_cert,
            &self.cluster_key,
            &self.server_ca_cert,
            &self.server_cert,
            &self.server_key,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_use_well_known_locations() {
        let settings = ServerSettings::default();
        assert_eq!(settings.proxy_dir, Path::new("/.ocm/cluster-proxy/proxy"));
        assert_eq!(settings.agent_dir, Path::new("/.ocm/cluster-proxy/agent"));
        assert_eq!(settings.listen_addr.port(), 8090);
        assert_eq!(settings.agent_addr.port(), 8091);
        assert_eq!(settings.proxy_strategies, "destHost");
        assert_eq!(settings.server_count, 1);
    }

    #[test]
    fn agent_bundle_has_its_own_directory() {
        let settings = ServerSettings::default();
        assert_eq!(settings.dir_for(BundleRole::AgentServer), settings.agent_dir);
        assert_eq!(settings.dir_for(BundleRole::ProxyServer), settings.proxy_dir);
        assert_eq!(settings.dir_for(BundleRole::ProxyServerCA), settings.proxy_dir);
    }

    #[test]
    fn config_points_at_materialized_files() {
        let settings = ServerSettings {
            proxy_dir: PathBuf::from("/p"),
            agent_dir: PathBuf::from("/a"),
            ..Default::default()
        };
        let config = TunnelServerConfig::from_settings(&settings);

        assert_eq!(config.cluster_ca_cert, Path::new("/p/ca.crt"));
        assert_eq!(config.cluster_cert, Path::new("/p/tls.crt"));
        assert_eq!(config.cluster_key, Path::new("/p/tls.key"));
        assert_eq!(config.server_ca_cert, Path::new("/p/ca.crt"));
        assert_eq!(config.server_cert, Path::new("/a/tls.crt"));
        assert_eq!(config.server_key, Path::new("/a/tls.key"));
        assert_eq!(config.cert_paths().len(), 6);
    }
}
