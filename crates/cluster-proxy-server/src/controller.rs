//! Credential reconciler
//!
//! One pass fetches the three credential bundles, writes them to disk and
//! asks the supervisor to run a tunnel server built from them. The pass never
//! sleeps or retries on its own: it hands the controller an [`Action`] whose
//! delay comes from the shared [`Backoff`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use cluster_proxy_common::retry::{Backoff, RetryConfig};
use cluster_proxy_common::Error;

use crate::bundle::{combined_fingerprint, BundleRole, CredentialBundle};
use crate::config::{ServerSettings, TunnelServerConfig};
use crate::materializer::materialize;
use crate::supervisor::TunnelServerSupervisor;

/// Where credential bundles are read from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the bundle for `role`, or `None` if its Secret does not exist yet
    async fn get_bundle(&self, role: BundleRole) -> Result<Option<CredentialBundle>, Error>;
}

/// Reads bundles from Secrets in one namespace
pub struct KubeSecretSource {
    api: Api<Secret>,
}

impl KubeSecretSource {
    /// Create a source reading Secrets from `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn get_bundle(&self, role: BundleRole) -> Result<Option<CredentialBundle>, Error> {
        let secret = self.api.get_opt(role.secret_name()).await?;
        Ok(secret.map(|s| CredentialBundle::from_secret(role, &s)))
    }
}

/// Shared state for reconcile passes
pub struct Context {
    /// Bundle source
    pub source: Arc<dyn SecretSource>,
    /// Supervisor of the single tunnel server
    pub supervisor: Arc<TunnelServerSupervisor>,
    /// Target directories and listen addresses
    pub settings: ServerSettings,
    backoff: Mutex<Backoff>,
}

impl Context {
    /// Bundle everything a reconcile pass needs
    pub fn new(
        source: Arc<dyn SecretSource>,
        supervisor: Arc<TunnelServerSupervisor>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            source,
            supervisor,
            settings,
            backoff: Mutex::new(Backoff::default()),
        }
    }

    /// Override the requeue backoff
    pub fn with_retry(self, config: RetryConfig) -> Self {
        *self.backoff.lock() = Backoff::new(config);
        self
    }

    /// Delay before the next retry; grows with every call until reset
    pub fn next_backoff(&self) -> Duration {
        self.backoff.lock().next_delay()
    }

    /// Retries since the last successful pass
    pub fn retry_attempts(&self) -> u32 {
        self.backoff.lock().attempts()
    }

    fn reset_backoff(&self) {
        self.backoff.lock().reset();
    }
}

/// Reconcile the tunnel server against the current credential Secrets.
///
/// `trigger` is the Secret whose change woke the controller and is only used
/// for logging: every pass looks at all three bundles.
pub async fn reconcile(trigger: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = trigger.name_any();
    debug!(trigger = %key, "Reconciling tunnel server credentials");

    let mut bundles = Vec::with_capacity(BundleRole::ALL.len());
    for role in BundleRole::ALL {
        match ctx.source.get_bundle(role).await? {
            Some(bundle) => bundles.push(bundle),
            None => {
                // Expected while the signer has not issued everything yet
                let delay = ctx.next_backoff();
                info!(secret = %role, ?delay, "Credential secret not found yet, requeueing");
                return Ok(Action::requeue(delay));
            }
        }
    }

    let fingerprint = combined_fingerprint(&bundles);

    for bundle in &bundles {
        materialize(bundle, ctx.settings.dir_for(bundle.role())).await?;
    }

    let config = TunnelServerConfig::from_settings(&ctx.settings);
    ctx.supervisor.ensure(config, &fingerprint).await?;

    ctx.reset_backoff();
    debug!(trigger = %key, fingerprint = %fingerprint, "Tunnel server credentials in sync");
    Ok(Action::await_change())
}

/// Requeue a failed pass after the next backoff delay
pub fn error_policy(trigger: Arc<Secret>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.next_backoff();
    warn!(
        trigger = %trigger.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        attempt = ctx.retry_attempts(),
        ?delay,
        "Reconcile failed, requeueing"
    );
    Action::requeue(delay)
}
