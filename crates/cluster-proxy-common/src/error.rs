//! Error types for cluster-proxy
//!
//! Errors carry structured context (bundle name, file path, endpoint) so that
//! a single log line is enough to tell which credential or connection failed.

use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster-proxy operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A credential bundle does not exist (yet)
    #[error("credential bundle {bundle} not found")]
    NotFound {
        /// Name of the missing bundle
        bundle: String,
    },

    /// A credential bundle is present but unusable
    #[error("validation error for {bundle}: {message}")]
    Validation {
        /// Name of the malformed bundle
        bundle: String,
        /// Description of what's invalid
        message: String,
    },

    /// Filesystem failure while materializing credentials
    #[error("io error at {path}: {source}")]
    Io {
        /// Directory or file being written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The tunnel engine failed to start or bind
    #[error("tunnel server launch failed: {message}")]
    Launch {
        /// Description of what failed
        message: String,
    },

    /// The endpoint pool has no ready candidate
    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    /// A relayed connection failed mid-flight
    #[error("transport error [{endpoint}]: {source}")]
    Transport {
        /// Remote endpoint of the failed connection
        endpoint: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "supervisor", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the named bundle
    pub fn not_found(bundle: impl Into<String>) -> Self {
        Self::NotFound {
            bundle: bundle.into(),
        }
    }

    /// Create a validation error with bundle context
    pub fn validation(bundle: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            bundle: bundle.into(),
            message: msg.into(),
        }
    }

    /// Create an I/O error for the given path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a launch error with the given message
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch {
            message: msg.into(),
        }
    }

    /// Create a transport error for the given endpoint
    pub fn transport(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error should be retried by the caller's backoff
    ///
    /// Reconcile-path errors are all transient (missing bundles appear during
    /// bootstrap, rotated bundles get fixed by the signer). A transport error
    /// belongs to a single relayed connection and is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx responses will not change by asking again
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::NotFound { .. } => true,
            Error::Validation { .. } => true,
            Error::Io { .. } => true,
            Error::Launch { .. } => true,
            Error::NoHealthyEndpoint => true,
            Error::Transport { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the bundle name if this error is associated with a credential bundle
    pub fn bundle(&self) -> Option<&str> {
        match self {
            Error::NotFound { bundle } => Some(bundle),
            Error::Validation { bundle, .. } => Some(bundle),
            _ => None,
        }
    }
}
