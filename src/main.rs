//! NodePort allocator - admission webhook and deletion controller

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodeport_allocator::config::GlobalConfig;
use nodeport_allocator::controller;
use nodeport_allocator::leader::{identity, lease_namespace, LeaderElector, LEADER_LEASE_NAME};
use nodeport_allocator::manager::{KubeServiceLister, Manager};
use nodeport_allocator::store::ConfigMapStore;
use nodeport_allocator::webhook::{webhook_router, WebhookState};

/// NodePort allocator - cluster-wide NodePort assignment for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "nodeport-allocator", version, about, long_about = None)]
struct Cli {
    /// Path to the allocator configuration file
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Enable leader election for the deletion controller
    #[arg(long)]
    leader_elect: bool,

    /// Metrics server listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Health probe listen address
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Admission webhook HTTPS port
    #[arg(long, default_value = "9443")]
    webhook_port: u16,

    /// Directory holding the webhook serving certificate (tls.crt, tls.key)
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    webhook_cert_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    // Config comes first so its log level can seed the filter
    let config = GlobalConfig::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!(config = %cli.config.display(), "nodeport allocator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Build and initialize the port manager
    let store = ConfigMapStore::new(client.clone(), &config.storage)
        .map_err(|e| anyhow::anyhow!("Failed to create state store: {}", e))?;
    let manager = Arc::new(Manager::new(config, Arc::new(store)));

    manager
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize port manager: {}", e))?;

    // Admission must not open before the bitmaps reflect the live cluster
    manager
        .scan_existing_services(&KubeServiceLister::new(client.clone()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to scan existing services: {}", e))?;

    // Health probes
    let probe_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let probe_listener = tokio::net::TcpListener::bind(cli.health_probe_bind_address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind probe address: {}", e))?;
    tracing::info!(addr = %cli.health_probe_bind_address, "health probe server listening");
    let probe_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(probe_listener, probe_router).await {
            tracing::error!(error = %e, "probe server error");
        }
    });

    // Range usage metrics
    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(manager.clone());
    let metrics_listener = tokio::net::TcpListener::bind(cli.metrics_bind_address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind metrics address: {}", e))?;
    tracing::info!(addr = %cli.metrics_bind_address, "metrics server listening");
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    // Admission webhook over TLS
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
        cli.webhook_cert_dir.join("tls.crt"),
        cli.webhook_cert_dir.join("tls.key"),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to load webhook TLS certificates: {}", e))?;

    let webhook_addr = SocketAddr::from(([0, 0, 0, 0], cli.webhook_port));
    let state = Arc::new(WebhookState::new(manager.clone()));
    let router = webhook_router(state);
    tracing::info!(addr = %webhook_addr, "admission webhook listening");
    let webhook_server = tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(webhook_addr, tls_config)
            .serve(router.into_make_service())
            .await
        {
            tracing::error!(error = %e, "webhook server error");
        }
    });

    // Deletion controller: every replica may serve admission, but only one
    // may release ports
    let controller_task = if cli.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &lease_namespace(),
            &identity(),
        ));
        let ctrl_client = client.clone();
        let ctrl_manager = manager.clone();
        tokio::spawn(async move {
            loop {
                let mut guard = match elector.clone().acquire().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!(error = %e, "leader election failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                tokio::select! {
                    _ = controller::run(ctrl_client.clone(), ctrl_manager.clone()) => break,
                    _ = guard.lost() => {
                        tracing::warn!("leadership lost, stopping controller");
                    }
                }
            }
        })
    } else {
        let ctrl_client = client.clone();
        let ctrl_manager = manager.clone();
        tokio::spawn(async move {
            controller::run(ctrl_client, ctrl_manager).await;
        })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;
    tracing::info!("shutdown signal received");

    webhook_server.abort();
    metrics_server.abort();
    probe_server.abort();
    controller_task.abort();

    tracing::info!("nodeport allocator shutting down");
    Ok(())
}

/// Render per-range usage gauges in Prometheus text exposition format
async fn metrics_handler(State(manager): State<Arc<Manager>>) -> String {
    let mut out = String::new();
    out.push_str("# TYPE nodeport_allocator_range_used gauge\n");
    out.push_str("# TYPE nodeport_allocator_range_available gauge\n");
    for stats in manager.stats().await {
        out.push_str(&format!(
            "nodeport_allocator_range_used{{range=\"{}\"}} {}\n",
            stats.name, stats.used
        ));
        out.push_str(&format!(
            "nodeport_allocator_range_available{{range=\"{}\"}} {}\n",
            stats.name, stats.available
        ));
    }
    out
}
