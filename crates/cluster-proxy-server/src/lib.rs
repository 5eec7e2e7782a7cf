//! Secret-driven tunnel server controller
//!
//! Watches the three credential Secrets, writes them to disk and keeps exactly
//! one tunnel server running with the current material.

#![deny(missing_docs)]

pub mod bundle;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod filter;
pub mod materializer;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use bundle::{combined_fingerprint, BundleRole, CredentialBundle};
pub use config::{ServerSettings, TunnelServerConfig};
pub use controller::{error_policy, reconcile, Context, KubeSecretSource, SecretSource};
pub use dispatcher::{credential_triggers, SecretEventTracker, SecretTriggers};
pub use engine::{ProcessTunnelEngine, TunnelEngine};
pub use filter::{SecretChangeFilter, SecretEvent};
pub use materializer::materialize;
pub use supervisor::{SupervisorState, TunnelServerSupervisor};
