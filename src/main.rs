//! cluster-proxy - credential-rotating tunnel server and round-robin local proxy

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cluster_proxy_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use cluster_proxy_common::{
    proxy_server_selector, AGENT_SECRETS_DIR, DEFAULT_LOCAL_PROXY_PORT, DEFAULT_PROXY_STRATEGY,
    DEFAULT_SERVER_COUNT, DEFAULT_TUNNEL_AGENT_PORT, DEFAULT_TUNNEL_SERVER_PORT, PROXY_NAMESPACE,
    PROXY_SECRETS_DIR,
};
use cluster_proxy_connector::{
    readiness, EndpointDialer, EndpointDiscovery, PodEndpointSource, PortForwardDialer,
    RoundRobinConnector, TcpDialer,
};
use cluster_proxy_server::engine::DEFAULT_PROXY_SERVER_BIN;
use cluster_proxy_server::{
    dispatcher, Context, KubeSecretSource, ProcessTunnelEngine, ServerSettings,
    TunnelServerSupervisor,
};

/// cluster-proxy - keeps a konnectivity tunnel server in step with its certificates
#[derive(Parser, Debug)]
#[command(name = "cluster-proxy", version, about, long_about = None)]
struct Cli {
    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    /// Namespace holding the credential Secrets and tunnel server Pods
    #[arg(long, env = "POD_NAMESPACE", default_value = PROXY_NAMESPACE, global = true)]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch credential Secrets and supervise the tunnel server
    ///
    /// Every change to agent-server, proxy-server or proxy-server-ca is
    /// written to disk and the tunnel server is restarted with the new
    /// material.
    Controller(ControllerArgs),

    /// Forward local connections to tunnel server Pods in rotation
    LocalProxy(LocalProxyArgs),
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Directory for the proxy-server and proxy-server-ca bundles
    #[arg(long, env = "PROXY_SECRETS_DIR", default_value = PROXY_SECRETS_DIR)]
    proxy_dir: PathBuf,

    /// Directory for the agent-server bundle
    #[arg(long, env = "AGENT_SECRETS_DIR", default_value = AGENT_SECRETS_DIR)]
    agent_dir: PathBuf,

    /// Address the tunnel server binds for proxied clients
    #[arg(long, env = "SERVER_BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_address: IpAddr,

    /// Port for proxied clients
    #[arg(long, env = "SERVER_PORT", default_value_t = DEFAULT_TUNNEL_SERVER_PORT)]
    server_port: u16,

    /// Port for tunnel agents
    #[arg(long, env = "AGENT_PORT", default_value_t = DEFAULT_TUNNEL_AGENT_PORT)]
    agent_port: u16,

    /// Routing strategy passed to the tunnel server
    #[arg(long, env = "PROXY_STRATEGIES", default_value = DEFAULT_PROXY_STRATEGY)]
    proxy_strategies: String,

    /// Replica count advertised to agents
    #[arg(long, env = "SERVER_COUNT", default_value_t = DEFAULT_SERVER_COUNT)]
    server_count: u32,

    /// Tunnel server executable
    #[arg(long, env = "PROXY_SERVER_BIN", default_value = DEFAULT_PROXY_SERVER_BIN)]
    proxy_server_bin: PathBuf,

    /// Seconds the tunnel server gets after SIGTERM before it is killed
    #[arg(long, env = "STOP_GRACE_SECS", default_value = "10")]
    stop_grace_secs: u64,

    /// Seconds a stop may take in total before the engine task is aborted
    #[arg(long, env = "STOP_TIMEOUT_SECS", default_value = "30")]
    stop_timeout_secs: u64,

    /// Seconds a launch may take before it counts as failed
    #[arg(long, env = "LAUNCH_TIMEOUT_SECS", default_value = "30")]
    launch_timeout_secs: u64,
}

/// Local proxy mode arguments
#[derive(Args, Debug)]
struct LocalProxyArgs {
    /// Address to accept local connections on
    #[arg(long, env = "LISTEN_ADDRESS", default_value_t = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_LOCAL_PROXY_PORT))]
    listen: SocketAddr,

    /// Port dialed on each tunnel server Pod
    #[arg(long, env = "ENDPOINT_PORT", default_value_t = DEFAULT_TUNNEL_AGENT_PORT)]
    endpoint_port: u16,

    /// Label selector for tunnel server Pods
    #[arg(long, env = "ENDPOINT_SELECTOR", default_value_t = proxy_server_selector())]
    selector: String,

    /// Seconds between endpoint refreshes
    #[arg(long, env = "REFRESH_INTERVAL_SECS", default_value = "10")]
    refresh_interval_secs: u64,

    /// Seconds open relays may drain on shutdown
    #[arg(long, env = "DRAIN_GRACE_SECS", default_value = "10")]
    drain_grace_secs: u64,

    /// Seconds allowed for dialing a tunnel server Pod
    #[arg(long, env = "DIAL_TIMEOUT_SECS", default_value = "5")]
    dial_timeout_secs: u64,

    /// Kubeconfig for the hub cluster running the tunnel servers.
    ///
    /// When set, Pods are discovered on the hub and reached through
    /// apiserver port-forwards. Otherwise Pod IPs are dialed directly.
    #[arg(long, env = "HUB_KUBECONFIG")]
    hub_kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client needs a process-wide rustls provider before it is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "cluster-proxy".to_string(),
        format: cli.log_format,
    })?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Controller(args) => run_controller(cli.namespace, args, shutdown).await,
        Commands::LocalProxy(args) => run_local_proxy(cli.namespace, args, shutdown).await,
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal, shutting down"),
        }
        shutdown.cancel();
    });
}

/// Watch credential Secrets and keep the tunnel server running
async fn run_controller(
    namespace: String,
    args: ControllerArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let settings = ServerSettings {
        proxy_dir: args.proxy_dir,
        agent_dir: args.agent_dir,
        listen_addr: SocketAddr::new(args.bind_address, args.server_port),
        agent_addr: SocketAddr::new(args.bind_address, args.agent_port),
        proxy_strategies: args.proxy_strategies,
        server_count: args.server_count,
    };
    info!(
        namespace = %namespace,
        proxy_dir = %settings.proxy_dir.display(),
        agent_dir = %settings.agent_dir.display(),
        listen = %settings.listen_addr,
        agent = %settings.agent_addr,
        "Starting cluster-proxy controller"
    );

    let engine = Arc::new(
        ProcessTunnelEngine::new(args.proxy_server_bin)
            .with_stop_grace(Duration::from_secs(args.stop_grace_secs)),
    );
    let supervisor = Arc::new(
        TunnelServerSupervisor::new(engine, shutdown.clone())
            .with_stop_timeout(Duration::from_secs(args.stop_timeout_secs))
            .with_launch_timeout(Duration::from_secs(args.launch_timeout_secs)),
    );
    let source = Arc::new(KubeSecretSource::new(client.clone(), &namespace));
    let ctx = Arc::new(Context::new(source, supervisor.clone(), settings));

    let secrets: Api<Secret> = Api::namespaced(client, &namespace);
    dispatcher::run(ctx, secrets, &namespace, shutdown.clone()).await;

    // The watch can end on its own; make sure the tunnel server goes with it
    shutdown.cancel();
    supervisor
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to stop tunnel server: {}", e))?;

    info!("cluster-proxy controller stopped");
    Ok(())
}

/// Forward local connections across the discovered tunnel server Pods
async fn run_local_proxy(
    namespace: String,
    args: LocalProxyArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (client, dialer): (Client, Arc<dyn EndpointDialer>) = match &args.hub_kubeconfig {
        Some(path) => {
            let client = hub_client(path).await?;
            info!(kubeconfig = %path.display(), "Running local port-forward proxy against hub");
            let dialer = PortForwardDialer::new(client.clone(), &namespace, args.endpoint_port);
            (client, Arc::new(dialer))
        }
        None => {
            let client = Client::try_default()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
            (client, Arc::new(TcpDialer))
        }
    };

    info!(
        namespace = %namespace,
        listen = %args.listen,
        selector = %args.selector,
        port_forward = args.hub_kubeconfig.is_some(),
        "Starting cluster-proxy local proxy"
    );

    let (ready, readiness_handle) = readiness();
    let connector = Arc::new(
        RoundRobinConnector::new(readiness_handle)
            .with_dialer(dialer)
            .with_dial_timeout(Duration::from_secs(args.dial_timeout_secs))
            .with_drain_grace(Duration::from_secs(args.drain_grace_secs)),
    );

    let source = Arc::new(PodEndpointSource::new(
        client,
        &namespace,
        args.selector,
        args.endpoint_port,
    ));
    let discovery = EndpointDiscovery::new(source, connector.clone())
        .with_interval(Duration::from_secs(args.refresh_interval_secs));
    let discovery_task = tokio::spawn(discovery.run(ready, shutdown.clone()));

    let result = connector.listen(args.listen, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = discovery_task.await {
        warn!(error = %e, "Endpoint discovery task failed");
    }

    result.map_err(|e| anyhow::anyhow!("Local proxy failed: {}", e))?;
    info!("cluster-proxy local proxy stopped");
    Ok(())
}

/// Client for the hub cluster described by the kubeconfig at `path`
async fn hub_client(path: &std::path::Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("Failed to read hub kubeconfig {}: {}", path.display(), e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Invalid hub kubeconfig {}: {}", path.display(), e))?;
    Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("Failed to create hub Kubernetes client: {}", e))
}
