//! Secret watch dispatcher
//!
//! Feeds a [`Controller`] from a Secret watch. The raw watcher only reports
//! "this object now looks like X", so a last-seen cache turns that into typed
//! [`SecretEvent`]s before they reach the [`SecretChangeFilter`]. Only
//! admitted changes become controller triggers; requeue timing comes from the
//! [`Action`](kube::runtime::controller::Action)s that [`reconcile`] and
//! [`error_policy`] return.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cluster_proxy_common::WATCH_TIMEOUT_SECS;

use crate::bundle::BundleRole;
use crate::controller::{error_policy, reconcile, Context};
use crate::filter::{SecretChangeFilter, SecretEvent};

/// Classifies raw watch events using the last state seen per Secret
#[derive(Debug, Default)]
pub struct SecretEventTracker {
    seen: HashMap<String, Secret>,
    relist: Option<Vec<Secret>>,
}

impl SecretEventTracker {
    /// Empty tracker; everything is unseen
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn one watcher event into zero or more typed events.
    ///
    /// A relist (`Init` .. `InitDone`) is held back until `InitDone`, when the
    /// reflector commits it, and reports Secrets that vanished while the watch
    /// was down as deletions.
    pub fn observe(&mut self, event: Event<Secret>) -> Vec<SecretEvent> {
        match event {
            Event::Init => {
                self.relist = Some(Vec::new());
                Vec::new()
            }
            Event::InitApply(secret) => match self.relist.as_mut() {
                Some(listed) => {
                    listed.push(secret);
                    Vec::new()
                }
                None => self.apply(secret).into_iter().collect(),
            },
            Event::InitDone => {
                let Some(listed) = self.relist.take() else {
                    return Vec::new();
                };
                let names: Vec<String> = listed.iter().map(|s| s.name_any()).collect();
                let gone: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|name| !names.contains(*name))
                    .cloned()
                    .collect();

                let mut events: Vec<SecretEvent> = listed
                    .into_iter()
                    .filter_map(|secret| self.apply(secret))
                    .collect();
                events.extend(
                    gone.into_iter()
                        .filter_map(|name| self.seen.remove(&name))
                        .map(SecretEvent::Deleted),
                );
                events
            }
            Event::Apply(secret) => self.apply(secret).into_iter().collect(),
            Event::Delete(secret) => {
                self.seen.remove(&secret.name_any());
                vec![SecretEvent::Deleted(secret)]
            }
        }
    }

    fn apply(&mut self, secret: Secret) -> Option<SecretEvent> {
        let name = secret.name_any();
        match self.seen.insert(name, secret.clone()) {
            None => Some(SecretEvent::Created(secret)),
            Some(old) if is_replay(&old, &secret) => None,
            Some(old) => Some(SecretEvent::Updated { old, new: secret }),
        }
    }

    /// A credential Secret that is still present, if any
    pub fn any_credential(&self) -> Option<&Secret> {
        BundleRole::ALL
            .iter()
            .find_map(|role| self.seen.get(role.secret_name()))
    }

    /// Number of Secrets currently tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when no Secret is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Relists replay objects that did not change
fn is_replay(old: &Secret, new: &Secret) -> bool {
    old.metadata.resource_version.is_some()
        && old.metadata.resource_version == new.metadata.resource_version
        && old.data == new.data
}

/// Turns watch events into the Secrets the controller should reconcile
#[derive(Debug)]
pub struct SecretTriggers {
    tracker: SecretEventTracker,
    filter: SecretChangeFilter,
}

impl SecretTriggers {
    /// Triggers for credential Secrets in `namespace`
    pub fn new(namespace: &str) -> Self {
        Self {
            tracker: SecretEventTracker::new(),
            filter: SecretChangeFilter::new(namespace),
        }
    }

    /// Classify and filter one watch event.
    ///
    /// A deleted credential has no object left to reconcile, so a surviving
    /// credential Secret stands in for it. The pass then finds the gap and
    /// requeues.
    pub fn admit(&mut self, event: Event<Secret>) -> Vec<Secret> {
        let mut triggers = Vec::new();
        for change in self.tracker.observe(event) {
            let name = change.name();
            if !self.filter.should_enqueue(&change) {
                debug!(secret = %name, "Ignoring Secret change");
                continue;
            }
            info!(secret = %name, "Credential Secret changed");
            match change {
                SecretEvent::Created(secret) | SecretEvent::Updated { new: secret, .. } => {
                    triggers.push(secret)
                }
                SecretEvent::Deleted(_) => match self.tracker.any_credential() {
                    Some(survivor) => triggers.push(survivor.clone()),
                    None => debug!(secret = %name, "No credential Secret left to reconcile"),
                },
            }
        }
        triggers
    }
}

/// Map a raw watch stream onto controller triggers
pub fn credential_triggers<S>(
    events: S,
    namespace: &str,
) -> impl Stream<Item = Result<Secret, watcher::Error>> + Send + 'static
where
    S: Stream<Item = Result<Event<Secret>, watcher::Error>> + Send + 'static,
{
    let mut triggers = SecretTriggers::new(namespace);
    events.flat_map(move |event| {
        let admitted: Vec<Result<Secret, watcher::Error>> = match event {
            Ok(event) => triggers.admit(event).into_iter().map(Ok).collect(),
            // The watcher backs off internally before its next item
            Err(e) => vec![Err(e)],
        };
        futures::stream::iter(admitted)
    })
}

/// Reconcile credential Secrets in `namespace` until `shutdown` fires
pub async fn run(ctx: Arc<Context>, api: Api<Secret>, namespace: &str, shutdown: CancellationToken) {
    let (reader, writer) = reflector::store();
    let events = watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .reflect(writer);

    info!(namespace = %namespace, "Secret watch dispatcher started");

    // One pass at a time: every pass looks at all three bundles anyway
    Controller::for_stream(credential_triggers(events, namespace), reader)
        .with_config(controller::Config::default().concurrency(1))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((secret, action)) => {
                    debug!(secret = %secret.name, ?action, "Reconciliation completed");
                }
                // Already logged by error_policy
                Err(controller::Error::ReconcilerFailed(_, secret)) => {
                    debug!(secret = %secret.name, "Reconciliation failed");
                }
                Err(controller::Error::ObjectNotFound(secret)) => {
                    debug!(secret = %secret.name, "Trigger Secret is gone, skipping");
                }
                Err(e) => {
                    error!(error = ?e, "Secret controller error");
                }
            }
        })
        .await;

    info!("Secret watch dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;

    const NS: &str = "cluster-proxy";

    fn secret(name: &str, version: &str, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "tls.crt".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn names(secrets: &[Secret]) -> Vec<String> {
        secrets.iter().map(|s| s.name_any()).collect()
    }

    #[test]
    fn first_sighting_is_created_then_updated() {
        let mut tracker = SecretEventTracker::new();

        let events = tracker.observe(Event::Apply(secret("agent-server", "1", "A")));
        assert!(matches!(events.as_slice(), [SecretEvent::Created(_)]));

        let events = tracker.observe(Event::Apply(secret("agent-server", "2", "B")));
        match events.as_slice() {
            [SecretEvent::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn delete_is_reported_and_forgotten() {
        let mut tracker = SecretEventTracker::new();
        tracker.observe(Event::Apply(secret("proxy-server", "1", "A")));

        let events = tracker.observe(Event::Delete(secret("proxy-server", "1", "A")));
        assert!(matches!(events.as_slice(), [SecretEvent::Deleted(_)]));
        assert!(tracker.is_empty());

        // Seen again after deletion counts as a new Secret
        let events = tracker.observe(Event::Apply(secret("proxy-server", "3", "A")));
        assert!(matches!(events.as_slice(), [SecretEvent::Created(_)]));
    }

    #[test]
    fn relist_replay_of_unchanged_secret_is_silent() {
        let mut tracker = SecretEventTracker::new();
        tracker.observe(Event::Apply(secret("agent-server", "1", "A")));

        assert!(tracker.observe(Event::Init).is_empty());
        assert!(tracker
            .observe(Event::InitApply(secret("agent-server", "1", "A")))
            .is_empty());
        assert!(tracker.observe(Event::InitDone).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn relist_is_held_until_init_done() {
        let mut tracker = SecretEventTracker::new();

        tracker.observe(Event::Init);
        assert!(tracker
            .observe(Event::InitApply(secret("agent-server", "1", "A")))
            .is_empty());
        assert!(tracker.is_empty());

        let events = tracker.observe(Event::InitDone);
        assert!(matches!(events.as_slice(), [SecretEvent::Created(_)]));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn relist_reports_secrets_that_vanished() {
        let mut tracker = SecretEventTracker::new();
        tracker.observe(Event::Apply(secret("agent-server", "1", "A")));
        tracker.observe(Event::Apply(secret("proxy-server-ca", "1", "A")));

        tracker.observe(Event::Init);
        tracker.observe(Event::InitApply(secret("agent-server", "1", "A")));
        let events = tracker.observe(Event::InitDone);

        match events.as_slice() {
            [SecretEvent::Deleted(s)] => assert_eq!(s.name_any(), "proxy-server-ca"),
            other => panic!("expected one deletion, got {other:?}"),
        }
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn unrelated_secret_is_not_a_trigger() {
        let mut triggers = SecretTriggers::new(NS);

        assert!(triggers
            .admit(Event::Apply(secret("default-token", "1", "t")))
            .is_empty());
        assert!(triggers
            .admit(Event::Apply(secret("default-token", "2", "u")))
            .is_empty());
    }

    #[test]
    fn credential_changes_trigger_their_secret() {
        let mut triggers = SecretTriggers::new(NS);

        let created = triggers.admit(Event::Apply(secret("agent-server", "1", "A")));
        assert_eq!(names(&created), ["agent-server"]);

        // Same data under a new resourceVersion is not a credential change
        assert!(triggers
            .admit(Event::Apply(secret("agent-server", "2", "A")))
            .is_empty());

        let rotated = triggers.admit(Event::Apply(secret("agent-server", "3", "B")));
        assert_eq!(names(&rotated), ["agent-server"]);
        assert_eq!(rotated[0].metadata.resource_version.as_deref(), Some("3"));
    }

    #[test]
    fn deleted_credential_triggers_a_surviving_one() {
        let mut triggers = SecretTriggers::new(NS);
        triggers.admit(Event::Apply(secret("agent-server", "1", "A")));
        triggers.admit(Event::Apply(secret("proxy-server-ca", "1", "A")));

        let admitted = triggers.admit(Event::Delete(secret("agent-server", "1", "A")));
        assert_eq!(names(&admitted), ["proxy-server-ca"]);

        // Nothing left to stand in for the last one
        let admitted = triggers.admit(Event::Delete(secret("proxy-server-ca", "1", "A")));
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn trigger_stream_passes_watch_errors_through() {
        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(secret("proxy-server", "1", "A"))),
            Ok(Event::InitApply(secret("default-token", "1", "t"))),
            Ok(Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::Apply(secret("proxy-server", "2", "B"))),
        ]);

        let out: Vec<_> = credential_triggers(events, NS).collect().await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap().name_any(), "proxy-server");
        assert!(out[1].is_err());
        assert_eq!(
            out[2].as_ref().unwrap().metadata.resource_version.as_deref(),
            Some("2")
        );
    }
}
