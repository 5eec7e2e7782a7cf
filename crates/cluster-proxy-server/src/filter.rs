//! Secret change filter
//!
//! Decides whether a watched Secret change should trigger a reconcile. Only
//! the three credential Secrets count, and an update only counts when its
//! data actually changed. Anything unexpected is dropped (fail closed) so
//! that unrelated or no-op events never restart the tunnel server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use crate::bundle::BundleRole;

/// Data map of a Secret
pub type SecretData = BTreeMap<String, ByteString>;

/// A typed Secret change with before/after snapshots
#[derive(Debug, Clone)]
pub enum SecretEvent {
    /// A Secret appeared
    Created(Secret),
    /// A Secret changed
    Updated {
        /// Last observed state
        old: Secret,
        /// Current state
        new: Secret,
    },
    /// A Secret was removed
    Deleted(Secret),
}

impl SecretEvent {
    /// Name of the Secret the event is about
    pub fn name(&self) -> String {
        match self {
            SecretEvent::Created(s) | SecretEvent::Deleted(s) => s.name_any(),
            SecretEvent::Updated { new, .. } => new.name_any(),
        }
    }
}

/// Admits only changes to the credential Secrets in one namespace
#[derive(Debug, Clone)]
pub struct SecretChangeFilter {
    namespace: String,
}

impl SecretChangeFilter {
    /// Create a filter for Secrets in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// A created Secret matters iff it is one of the credential Secrets
    pub fn should_enqueue_on_create(&self, name: &str) -> bool {
        is_recognized(name)
    }

    /// A deleted Secret matters iff it is one of the credential Secrets
    pub fn should_enqueue_on_delete(&self, name: &str) -> bool {
        is_recognized(name)
    }

    /// An update matters iff it is a credential Secret and its data changed
    ///
    /// A missing data map is the same as an empty one.
    pub fn should_enqueue_on_update(
        &self,
        name: &str,
        old: Option<&SecretData>,
        new: Option<&SecretData>,
    ) -> bool {
        if !is_recognized(name) {
            return false;
        }
        let empty = SecretData::new();
        old.unwrap_or(&empty) != new.unwrap_or(&empty)
    }

    /// Classify a full event
    pub fn should_enqueue(&self, event: &SecretEvent) -> bool {
        match event {
            SecretEvent::Created(secret) => {
                self.in_namespace(secret) && self.should_enqueue_on_create(&secret.name_any())
            }
            SecretEvent::Deleted(secret) => {
                self.in_namespace(secret) && self.should_enqueue_on_delete(&secret.name_any())
            }
            SecretEvent::Updated { old, new } => {
                let name = new.name_any();
                // Snapshots of two different objects are not an update
                if old.name_any() != name || !self.in_namespace(old) || !self.in_namespace(new) {
                    return false;
                }
                self.should_enqueue_on_update(&name, old.data.as_ref(), new.data.as_ref())
            }
        }
    }

    fn in_namespace(&self, secret: &Secret) -> bool {
        secret
            .metadata
            .namespace
            .as_deref()
            .map(|ns| ns == self.namespace)
            .unwrap_or(true)
    }
}

fn is_recognized(name: &str) -> bool {
    BundleRole::from_secret_name(name).is_some()
}
