//! Tunnel engine seam
//!
//! The tunnel server itself is opaque: something that takes a
//! [`TunnelServerConfig`] and a cancellation token and serves until told to
//! stop. [`ProcessTunnelEngine`] runs the konnectivity `proxy-server`
//! executable.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cluster_proxy_common::Error;

use crate::config::TunnelServerConfig;

/// Long-running serve future returned by a successful start
pub type EngineRun = BoxFuture<'static, Result<(), Error>>;

/// Default executable name, resolved through `PATH`
pub const DEFAULT_PROXY_SERVER_BIN: &str = "proxy-server";

/// An exit inside this window after spawn counts as a failed launch
const DEFAULT_STARTUP_PROBE: Duration = Duration::from_millis(500);

/// How long the child gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Something that can run the tunnel server
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Acquire the engine's resources and return the future that serves
    /// until `cancel` fires.
    ///
    /// On error, anything acquired so far (listeners, child processes) must
    /// already be released.
    async fn start(
        &self,
        config: TunnelServerConfig,
        cancel: CancellationToken,
    ) -> Result<EngineRun, Error>;
}

/// Runs the tunnel server as a child process
#[derive(Debug, Clone)]
pub struct ProcessTunnelEngine {
    binary: PathBuf,
    startup_probe: Duration,
    stop_grace: Duration,
}

impl Default for ProcessTunnelEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PROXY_SERVER_BIN)
    }
}

impl ProcessTunnelEngine {
    /// Engine launching `binary`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            startup_probe: DEFAULT_STARTUP_PROBE,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Override how long a fresh child must survive to count as launched
    pub fn with_startup_probe(mut self, probe: Duration) -> Self {
        self.startup_probe = probe;
        self
    }

    /// Override how long a cancelled child may take to exit on SIGTERM.
    ///
    /// Keep this below the supervisor's stop timeout.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command(&self, config: &TunnelServerConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(proxy_server_args(config))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Command line for the konnectivity proxy-server
pub fn proxy_server_args(config: &TunnelServerConfig) -> Vec<String> {
    let path = |p: &PathBuf| p.display().to_string();
    vec![
        format!("--cluster-ca-cert={}", path(&config.cluster_ca_cert)),
        format!("--cluster-cert={}", path(&config.cluster_cert)),
        format!("--cluster-key={}", path(&config.cluster_key)),
        format!("--server-ca-cert={}", path(&config.server_ca_cert)),
        format!("--server-cert={}", path(&config.server_cert)),
        format!("--server-key={}", path(&config.server_key)),
        format!("--proxy-strategies={}", config.proxy_strategies),
        format!("--server-count={}", config.server_count),
        format!("--server-bind-address={}", config.listen_addr.ip()),
        format!("--server-port={}", config.listen_addr.port()),
        format!("--agent-bind-address={}", config.agent_addr.ip()),
        format!("--agent-port={}", config.agent_addr.port()),
    ]
}

#[async_trait]
impl TunnelEngine for ProcessTunnelEngine {
    async fn start(
        &self,
        config: TunnelServerConfig,
        cancel: CancellationToken,
    ) -> Result<EngineRun, Error> {
        for path in config.cert_paths() {
            if let Err(e) = tokio::fs::metadata(path).await {
                return Err(Error::launch(format!(
                    "certificate file {} is not readable: {}",
                    path.display(),
                    e
                )));
            }
        }

        let mut child = self.command(&config).spawn().map_err(|e| {
            Error::launch(format!("failed to spawn {}: {}", self.binary.display(), e))
        })?;
        let pid = child.id();

        // A child that dies right away (bad flags, port in use) is a launch failure
        match tokio::time::timeout(self.startup_probe, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(Error::launch(format!(
                    "{} exited during startup: {}",
                    self.binary.display(),
                    status
                )));
            }
            Ok(Err(e)) => {
                // Dropping the child kills it
                return Err(Error::launch(format!("failed to wait on child: {e}")));
            }
            Err(_) => {}
        }

        info!(
            pid,
            binary = %self.binary.display(),
            listen = %config.listen_addr,
            agent = %config.agent_addr,
            "Tunnel server process started"
        );
        Ok(Box::pin(supervise_child(child, cancel, self.stop_grace)))
    }
}

async fn supervise_child(
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<(), Error> {
    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| Error::launch(format!("failed to wait on child: {e}")))?;
            Err(Error::launch(format!("tunnel server exited: {status}")))
        }
        _ = cancel.cancelled() => {
            terminate(&mut child, grace).await;
            Ok(())
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    debug!(pid, ?grace, "Stopping tunnel server process");

    let target = Pid::from_raw(pid as i32);
    if let Err(e) = kill(target, Signal::SIGTERM) {
        warn!(pid, error = %e, "Failed to send SIGTERM to tunnel server");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(pid, %status, "Tunnel server process exited"),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for tunnel server, killing");
            child.kill().await.ok();
        }
        Err(_) => {
            warn!(pid, ?grace, "Tunnel server ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "Failed to kill tunnel server process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;

    fn config_in(dir: &std::path::Path) -> TunnelServerConfig {
        TunnelServerConfig::from_settings(&ServerSettings {
            proxy_dir: dir.join("proxy"),
            agent_dir: dir.join("agent"),
            ..Default::default()
        })
    }

    fn write_certs(config: &TunnelServerConfig) {
        for path in config.cert_paths() {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"pem").unwrap();
        }
    }

    #[test]
    fn args_carry_every_path_and_setting() {
        let config = config_in(std::path::Path::new("/x"));
        let args = proxy_server_args(&config);

        assert!(args.contains(&"--cluster-ca-cert=/x/proxy/ca.crt".to_string()));
        assert!(args.contains(&"--server-cert=/x/agent/tls.crt".to_string()));
        assert!(args.contains(&"--server-key=/x/agent/tls.key".to_string()));
        assert!(args.contains(&"--proxy-strategies=destHost".to_string()));
        assert!(args.contains(&"--server-count=1".to_string()));
        assert!(args.contains(&"--server-port=8090".to_string()));
        assert!(args.contains(&"--agent-port=8091".to_string()));
        assert_eq!(args.len(), 12);
    }

    #[tokio::test]
    async fn missing_certificate_is_launch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ProcessTunnelEngine::new("sleep");

        let err = engine
            .start(config_in(tmp.path()), CancellationToken::new())
            .await
            .err()
            .expect("start should fail");

        assert!(matches!(err, Error::Launch { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_launch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_certs(&config);
        let engine = ProcessTunnelEngine::new(tmp.path().join("no-such-binary"));

        let err = engine
            .start(config, CancellationToken::new())
            .await
            .err()
            .expect("start should fail");

        assert!(err.to_string().contains("failed to spawn"), "{err}");
    }

    /// Write an executable shell script standing in for proxy-server
    fn fake_server(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("proxy-server");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Start, retrying while another test's fork still holds the script open
    async fn start_retrying(
        engine: &ProcessTunnelEngine,
        config: &TunnelServerConfig,
        cancel: &CancellationToken,
    ) -> EngineRun {
        for _ in 0..10 {
            match engine.start(config.clone(), cancel.clone()).await {
                Ok(run) => return run,
                Err(e) if e.to_string().contains("busy") => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("start failed: {e}"),
            }
        }
        panic!("start kept failing with a busy executable");
    }

    #[tokio::test]
    async fn cancel_sends_sigterm_before_killing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_certs(&config);
        let marker = tmp.path().join("terminated");
        let script = fake_server(
            tmp.path(),
            &format!(
                "trap 'touch {}; exit 0' TERM\nwhile true; do sleep 0.05; done",
                marker.display()
            ),
        );
        let engine = ProcessTunnelEngine::new(script)
            .with_startup_probe(Duration::from_millis(200))
            .with_stop_grace(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let run = tokio::spawn(start_retrying(&engine, &config, &cancel).await);
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert!(marker.exists(), "tunnel server never saw SIGTERM");
    }

    #[tokio::test]
    async fn child_ignoring_sigterm_is_killed_after_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_certs(&config);
        let script = fake_server(tmp.path(), "trap '' TERM\nwhile true; do sleep 0.05; done");
        let engine = ProcessTunnelEngine::new(script)
            .with_startup_probe(Duration::from_millis(200))
            .with_stop_grace(Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let run = tokio::spawn(start_retrying(&engine, &config, &cancel).await);
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("stuck child should be killed after the grace period")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn child_exiting_during_startup_is_launch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_certs(&config);
        // `true` ignores its arguments and exits immediately
        let engine = ProcessTunnelEngine::new("true").with_startup_probe(Duration::from_secs(5));

        let err = engine
            .start(config, CancellationToken::new())
            .await
            .err()
            .expect("start should fail");

        assert!(err.to_string().contains("exited during startup"), "{err}");
    }
}
