//! Credential bundles and their fingerprints

use std::collections::BTreeMap;
use std::fmt;

use aws_lc_rs::digest::{Context, SHA256};
use k8s_openapi::api::core::v1::Secret;

use cluster_proxy_common::{AGENT_SERVER_SECRET, PROXY_SERVER_CA_SECRET, PROXY_SERVER_SECRET};

/// The three credential bundles the tunnel server is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BundleRole {
    /// Certificate and key presented to tunnel agents
    AgentServer,
    /// Certificate and key presented to proxied clients
    ProxyServer,
    /// CA bundle that signed the proxy certificates
    ProxyServerCA,
}

impl BundleRole {
    /// All roles, in materialization order
    pub const ALL: [BundleRole; 3] = [
        BundleRole::AgentServer,
        BundleRole::ProxyServer,
        BundleRole::ProxyServerCA,
    ];

    /// Name of the Secret backing this role
    pub fn secret_name(self) -> &'static str {
        match self {
            BundleRole::AgentServer => AGENT_SERVER_SECRET,
            BundleRole::ProxyServer => PROXY_SERVER_SECRET,
            BundleRole::ProxyServerCA => PROXY_SERVER_CA_SECRET,
        }
    }

    /// Resolve a Secret name to its role, if it is one of ours
    pub fn from_secret_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.secret_name() == name)
    }
}

impl fmt::Display for BundleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.secret_name())
    }
}

/// Certificate/key material for one role, keyed by file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    role: BundleRole,
    data: BTreeMap<String, Vec<u8>>,
    fingerprint: String,
}

impl CredentialBundle {
    /// Build a bundle from raw data, computing its fingerprint
    pub fn new(role: BundleRole, data: BTreeMap<String, Vec<u8>>) -> Self {
        let fingerprint = fingerprint_data(role, &data);
        Self {
            role,
            data,
            fingerprint,
        }
    }

    /// Build a bundle from a Secret; a Secret without data yields an empty bundle
    pub fn from_secret(role: BundleRole, secret: &Secret) -> Self {
        let data = secret
            .data
            .as_ref()
            .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default();
        Self::new(role, data)
    }

    /// Role this bundle fills
    pub fn role(&self) -> BundleRole {
        self.role
    }

    /// File name to content map
    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }

    /// Hex SHA-256 over role, keys and values
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True when the bundle carries no files
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fingerprint over a set of bundles, sensitive to every key and value
pub fn combined_fingerprint<'a>(bundles: impl IntoIterator<Item = &'a CredentialBundle>) -> String {
    let mut ctx = Context::new(&SHA256);
    for bundle in bundles {
        ctx.update(bundle.role.secret_name().as_bytes());
        ctx.update(b"=");
        ctx.update(bundle.fingerprint.as_bytes());
        ctx.update(b"\n");
    }
    hex(ctx.finish().as_ref())
}

fn fingerprint_data(role: BundleRole, data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut ctx = Context::new(&SHA256);
    ctx.update(role.secret_name().as_bytes());
    // Length prefixes keep ("a", "bc") and ("ab", "c") apart
    for (key, value) in data {
        ctx.update(&(key.len() as u64).to_be_bytes());
        ctx.update(key.as_bytes());
        ctx.update(&(value.len() as u64).to_be_bytes());
        ctx.update(value);
    }
    hex(ctx.finish().as_ref())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
