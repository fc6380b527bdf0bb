//! osirisd — the Osiris daemon.
//!
//! Single binary that runs one of the three control planes:
//!
//! - **proxy** — traffic-measuring sidecar next to an application container
//! - **zeroscaler** — scales idle opted-in workloads down to zero
//! - **activator** — wakes scaled-to-zero workloads on demand
//!
//! # Usage
//!
//! ```text
//! osirisd proxy --listen-port 8000 --app-port 8080 --stats-port 8002
//! osirisd zeroscaler --metrics-check-interval 150
//! osirisd activator --port 5000 --activation-timeout 60
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "osirisd", about = "Scale-to-zero for HTTP workloads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the traffic-measuring proxy sidecar.
    Proxy {
        /// Port the proxy listens on.
        #[arg(long, default_value = "8000")]
        listen_port: u16,

        /// Port the application listens on inside the pod.
        #[arg(long, default_value = "8080")]
        app_port: u16,

        /// Port for the stats/healthz endpoint.
        #[arg(long, default_value = "8002")]
        stats_port: u16,

        /// Comma-separated request paths that are never counted.
        #[arg(long, value_delimiter = ',')]
        ignored_paths: Vec<String>,

        /// Stable identifier reported with the request counter.
        /// Defaults to the pod name the kubelet puts in $HOSTNAME.
        #[arg(long, env = "OSIRIS_PROXY_ID")]
        proxy_id: Option<String>,
    },

    /// Run the zeroscaler controller.
    Zeroscaler {
        /// Port the sidecar stats endpoints listen on.
        #[arg(long, default_value = "8002")]
        stats_port: u16,

        /// Default seconds between idle-decision ticks.
        #[arg(long, default_value = "150")]
        metrics_check_interval: u64,

        /// Per-scrape request timeout in seconds.
        #[arg(long, default_value = "3")]
        scrape_timeout: u64,

        /// Port for the healthz endpoint.
        #[arg(long, default_value = "8081")]
        healthz_port: u16,
    },

    /// Run the activator.
    Activator {
        /// Port the activator listens on.
        #[arg(long, default_value = "5000")]
        port: u16,

        /// Seconds a request waits for its workload to become ready.
        #[arg(long, default_value = "60")]
        activation_timeout: u64,

        /// Seconds a completed activation lingers so concurrent
        /// arrivals short-circuit.
        #[arg(long, default_value = "10")]
        ready_ttl: u64,

        /// Largest request body buffered during the activation wait.
        #[arg(long, default_value = "4194304")]
        max_body_bytes: usize,

        /// Port for the healthz endpoint.
        #[arg(long, default_value = "8081")]
        healthz_port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,osirisd=debug,osiris=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Proxy {
            listen_port,
            app_port,
            stats_port,
            ignored_paths,
            proxy_id,
        } => run_proxy(listen_port, app_port, stats_port, ignored_paths, proxy_id).await,
        Command::Zeroscaler {
            stats_port,
            metrics_check_interval,
            scrape_timeout,
            healthz_port,
        } => {
            run_zeroscaler(
                stats_port,
                Duration::from_secs(metrics_check_interval),
                Duration::from_secs(scrape_timeout),
                healthz_port,
            )
            .await
        }
        Command::Activator {
            port,
            activation_timeout,
            ready_ttl,
            max_body_bytes,
            healthz_port,
        } => {
            run_activator(
                port,
                Duration::from_secs(activation_timeout),
                Duration::from_secs(ready_ttl),
                max_body_bytes,
                healthz_port,
            )
            .await
        }
    }
}

async fn run_proxy(
    listen_port: u16,
    app_port: u16,
    stats_port: u16,
    ignored_paths: Vec<String>,
    proxy_id: Option<String>,
) -> anyhow::Result<()> {
    let proxy_id = proxy_id.unwrap_or_else(default_proxy_id);
    info!(%proxy_id, listen_port, app_port, "osiris proxy starting");

    let request_count = Arc::new(AtomicU64::new(0));
    let proxy = osiris_proxy::SinglePortProxy::bind(
        osiris_proxy::ProxyConfig {
            listen_port,
            app_port,
            ignored_paths: ignored_paths
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect::<HashSet<_>>(),
        },
        request_count.clone(),
    )
    .await?;

    let stats_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], stats_port))).await?;
    let stats_state = osiris_proxy::StatsState {
        proxy_id,
        request_count,
    };

    let shutdown = shutdown_channel();
    let stats_shutdown = shutdown.clone();
    let stats_handle = tokio::spawn(async move {
        osiris_proxy::stats::serve(stats_listener, stats_state, stats_shutdown).await
    });

    proxy.serve(shutdown).await?;
    let _ = stats_handle.await;

    info!("osiris proxy stopped");
    Ok(())
}

async fn run_zeroscaler(
    stats_port: u16,
    metrics_check_interval: Duration,
    scrape_timeout: Duration,
    healthz_port: u16,
) -> anyhow::Result<()> {
    info!(
        interval_secs = metrics_check_interval.as_secs(),
        "osiris zeroscaler starting"
    );
    let client = kube::Client::try_default().await?;

    let controller = osiris_zeroscaler::Controller::new(
        client,
        osiris_zeroscaler::ControllerConfig {
            stats_port,
            metrics_check_interval,
            scrape_timeout,
        },
    );

    let shutdown = shutdown_channel();
    let healthz_handle = tokio::spawn(serve_healthz(healthz_port, shutdown.clone()));

    controller.run(shutdown).await;
    let _ = healthz_handle.await;

    info!("osiris zeroscaler stopped");
    Ok(())
}

async fn run_activator(
    port: u16,
    activation_timeout: Duration,
    ready_ttl: Duration,
    max_body_bytes: usize,
    healthz_port: u16,
) -> anyhow::Result<()> {
    info!(port, "osiris activator starting");
    let client = kube::Client::try_default().await?;

    let state = osiris_activator::ClusterState::new();
    let tracker = osiris_activator::ActivationTracker::new(ready_ttl);
    let activator = osiris_activator::Activator::new(
        client.clone(),
        tracker,
        osiris_activator::ActivateConfig {
            activation_timeout,
            ..Default::default()
        },
    );

    let shutdown = shutdown_channel();
    let watch_handle = tokio::spawn(osiris_activator::watch::run_watchers(
        client,
        state.clone(),
        shutdown.clone(),
    ));
    let healthz_handle = tokio::spawn(serve_healthz(healthz_port, shutdown.clone()));

    let lookup: osiris_activator::server::HostLookup = {
        let state = state.clone();
        Arc::new(move |host: &str| state.lookup(host))
    };
    let server = osiris_activator::ActivatorServer::bind(
        SocketAddr::from(([0, 0, 0, 0], port)),
        lookup,
        Arc::new(activator),
        osiris_activator::ServerConfig { max_body_bytes },
    )
    .await?;

    server.serve(shutdown).await?;
    let _ = watch_handle.await;
    let _ = healthz_handle.await;

    info!("osiris activator stopped");
    Ok(())
}

/// Watch channel flipped by Ctrl-C / SIGTERM-equivalent.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Minimal liveness endpoint for the controller modes.
async fn serve_healthz(port: u16, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let router = axum::Router::new().route("/healthz", axum::routing::get(|| async { "ok" }));
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// Without an explicit id, fall back to the pod name (kubelet sets
/// $HOSTNAME) and finally to a start-time stamp. The id only has to be
/// stable for the life of this process.
fn default_proxy_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("osiris-proxy-{epoch_millis}")
    })
}
