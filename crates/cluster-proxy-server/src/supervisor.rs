//! Tunnel server supervisor
//!
//! Owns the lifecycle of the tunnel engine and guarantees at most one live
//! instance per process:
//!
//! ```text
//! NotStarted -> Launching -> Running -> Stopping -> NotStarted
//!                   |           |
//!                   +-> Failed <+
//! ```
//!
//! [`TunnelServerSupervisor::ensure`] is cheap when nothing changed and never
//! waits on the engine's lifetime: the engine's serve future runs on its own
//! task. Lifecycle transitions serialize on an async mutex, so a caller that
//! arrives while another is launching or stopping simply waits its turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cluster_proxy_common::Error;

use crate::config::TunnelServerConfig;
use crate::engine::TunnelEngine;

/// Default bound on a graceful stop before the engine task is aborted
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on engine startup
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable lifecycle state of the tunnel server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No instance has been launched, or the last one was stopped
    NotStarted,
    /// An instance is starting
    Launching,
    /// An instance is serving
    Running,
    /// An instance is being stopped
    Stopping,
    /// The last launch failed or the instance exited on its own
    Failed,
}

#[derive(Debug)]
struct Status {
    state: SupervisorState,
    generation: u64,
    fingerprint: Option<String>,
    last_error: Option<String>,
}

/// A launched engine and what it was launched with
struct TunnelServerInstance {
    generation: u64,
    fingerprint: String,
    config: TunnelServerConfig,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises the single tunnel server instance of this process
pub struct TunnelServerSupervisor {
    engine: Arc<dyn TunnelEngine>,
    instance: Mutex<Option<TunnelServerInstance>>,
    status: Arc<RwLock<Status>>,
    generations: AtomicU64,
    shutdown: CancellationToken,
    stop_timeout: Duration,
    launch_timeout: Duration,
}

impl TunnelServerSupervisor {
    /// Create a supervisor whose instances stop when `shutdown` fires
    pub fn new(engine: Arc<dyn TunnelEngine>, shutdown: CancellationToken) -> Self {
        Self {
            engine,
            instance: Mutex::new(None),
            status: Arc::new(RwLock::new(Status {
                state: SupervisorState::NotStarted,
                generation: 0,
                fingerprint: None,
                last_error: None,
            })),
            generations: AtomicU64::new(0),
            shutdown,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }

    /// Override the graceful stop bound
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Override the startup bound
    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        self.status.read().state
    }

    /// Fingerprint of the credentials the current instance was launched with
    pub fn fingerprint(&self) -> Option<String> {
        self.status.read().fingerprint.clone()
    }

    /// Message of the most recent launch or run failure
    pub fn last_error(&self) -> Option<String> {
        self.status.read().last_error.clone()
    }

    /// Make sure an instance built from `fingerprint` is running.
    ///
    /// - Running with the same fingerprint: nothing to do.
    /// - Not started, failed or exited: launch.
    /// - Running with a different fingerprint: stop (bounded), then launch.
    ///
    /// A launch failure leaves the supervisor in [`SupervisorState::Failed`]
    /// and is returned so the caller can retry later.
    pub async fn ensure(&self, config: TunnelServerConfig, fingerprint: &str) -> Result<(), Error> {
        let mut slot = self.instance.lock().await;

        if let Some(active) = slot.as_ref() {
            if active.fingerprint == fingerprint && !active.handle.is_finished() {
                debug!(
                    generation = active.generation,
                    "Tunnel server already running with current credentials"
                );
                return Ok(());
            }
        }

        if let Some(previous) = slot.take() {
            if previous.fingerprint != fingerprint {
                info!(
                    generation = previous.generation,
                    "Credentials rotated, restarting tunnel server"
                );
            } else {
                info!(
                    generation = previous.generation,
                    "Tunnel server exited, relaunching"
                );
            }
            if let Err(e) = self.stop_instance(previous).await {
                warn!(error = %e, "Previous tunnel server did not stop cleanly");
            }
        }

        *slot = Some(self.launch(config, fingerprint).await?);
        Ok(())
    }

    /// Stop the active instance, if any, and return to NotStarted
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut slot = self.instance.lock().await;
        match slot.take() {
            Some(active) => {
                info!(generation = active.generation, "Shutting down tunnel server");
                self.stop_instance(active).await
            }
            None => {
                let mut status = self.status.write();
                status.state = SupervisorState::NotStarted;
                status.fingerprint = None;
                Ok(())
            }
        }
    }

    async fn launch(
        &self,
        config: TunnelServerConfig,
        fingerprint: &str,
    ) -> Result<TunnelServerInstance, Error> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut status = self.status.write();
            status.state = SupervisorState::Launching;
            status.generation = generation;
            status.fingerprint = Some(fingerprint.to_string());
        }

        let cancel = self.shutdown.child_token();
        let started = tokio::time::timeout(
            self.launch_timeout,
            self.engine.start(config.clone(), cancel.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::launch(format!(
                "tunnel server did not start within {:?}",
                self.launch_timeout
            )))
        });

        let run = match started {
            Ok(run) => run,
            Err(e) => {
                cancel.cancel();
                let mut status = self.status.write();
                status.state = SupervisorState::Failed;
                status.last_error = Some(e.to_string());
                warn!(generation, error = %e, "Tunnel server launch failed");
                return Err(e);
            }
        };

        {
            let mut status = self.status.write();
            status.state = SupervisorState::Running;
            status.last_error = None;
        }
        info!(
            generation,
            listen = %config.listen_addr,
            agent = %config.agent_addr,
            "Tunnel server running"
        );

        let status = self.status.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = run.await;
            let mut status = status.write();
            if status.generation != generation {
                return;
            }
            if task_cancel.is_cancelled() {
                // Stopped on request, either by stop_instance or process shutdown
                if status.state != SupervisorState::Stopping {
                    debug!(generation, "Tunnel server stopped by shutdown");
                }
                status.state = SupervisorState::NotStarted;
                status.fingerprint = None;
                return;
            }
            // Exiting without being asked to is a failure either way
            status.state = SupervisorState::Failed;
            match result {
                Ok(()) => {
                    warn!(generation, "Tunnel server exited unexpectedly");
                    status.last_error = Some("tunnel server exited".to_string());
                }
                Err(e) => {
                    error!(generation, error = %e, "Tunnel server failed");
                    status.last_error = Some(e.to_string());
                }
            }
        });

        Ok(TunnelServerInstance {
            generation,
            fingerprint: fingerprint.to_string(),
            config,
            cancel,
            handle,
        })
    }

    async fn stop_instance(&self, mut instance: TunnelServerInstance) -> Result<(), Error> {
        self.status.write().state = SupervisorState::Stopping;
        debug!(
            generation = instance.generation,
            listen = %instance.config.listen_addr,
            "Stopping tunnel server"
        );

        instance.cancel.cancel();
        let result = match tokio::time::timeout(self.stop_timeout, &mut instance.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(Error::internal_with_context(
                "supervisor",
                format!("tunnel server task failed: {e}"),
            )),
            Err(_) => {
                warn!(
                    generation = instance.generation,
                    timeout = ?self.stop_timeout,
                    "Tunnel server did not stop in time, aborting"
                );
                instance.handle.abort();
                // Aborting drops the serve future and everything it holds
                let _ = instance.handle.await;
                Ok(())
            }
        };

        let mut status = self.status.write();
        if status.generation == instance.generation {
            status.state = SupervisorState::NotStarted;
            status.fingerprint = None;
        }
        result
    }
}
