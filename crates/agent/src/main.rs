//! Usage Agent - Kubernetes workload usage reporter
//!
//! This binary runs as a single Deployment per cluster, snapshotting the
//! resource requests and limits of every running pod once per period and
//! delivering the records to Amazon Kinesis Data Firehose.

use agent_lib::{
    api::{self, AppState},
    cache::{CacheError, NodeCache},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    observer::spawn_informer,
    scanner::UsageScannerBuilder,
    upload::{BatchUploader, DiscardSink, FirehoseSink, Uploader},
};
use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Api, Client};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use crate::config::{AgentConfig, Cli, LogFormat};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Only running pods are scanned; leaving this phase reads as a delete
const RUNNING_PODS_SELECTOR: &str = "status.phase=Running";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(&cli)?;

    init_tracing(config.log_format);
    info!(cluster = %config.cluster_name, "Starting usage-agent");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register_all(&components::ALL).await;

    // Initialize metrics
    let metrics = AgentMetrics::new();
    metrics.set_build_info(AGENT_VERSION, &config.cluster_name);

    let logger = StructuredLogger::new(&config.cluster_name);

    // Every task subscribes before any signal can be delivered
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let api_shutdown = shutdown_tx.subscribe();
    let node_shutdown = shutdown_tx.subscribe();
    let load_shutdown = shutdown_tx.subscribe();
    let pod_shutdown = shutdown_tx.subscribe();
    let scanner_shutdown = shutdown_tx.subscribe();

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        let reason = shutdown_signal().await;
        let _ = signal_tx.send(());
        reason
    });

    // Start health and metrics server
    let app_state = Arc::new(AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, api_shutdown));

    let client = kube_client(config.kubeconfig.as_deref()).await?;

    // Node cache cold start
    let (node_subscription, node_informer) = spawn_informer(
        Api::<Node>::all(client.clone()),
        watcher::Config::default(),
        node_shutdown,
    );
    let node_cache = Arc::new(
        NodeCache::new(
            config.cluster_name.clone(),
            config.node_cache_config(),
            metrics.clone(),
        )
        .with_health(health_registry.clone()),
    );
    let ready = match node_cache.load(node_subscription, load_shutdown).await {
        Ok(ready) => ready,
        Err(CacheError::ColdStartCancelled) => {
            let reason = signal_task.await.unwrap_or("signal task failed");
            logger.log_shutdown(reason);
            return Ok(());
        }
        Err(e) => {
            health_registry
                .set_unhealthy(components::NODE_CACHE, e.to_string())
                .await;
            error!(error = %e, "Node cache failed to start");
            return Err(e.into());
        }
    };
    let version = *ready.borrow();
    logger.log_cache_ready(node_cache.len().await, version);
    health_registry.set_ready(true).await;

    // Upload path
    let (uploader, sink): (Arc<dyn Uploader>, String) = if config.dry_run {
        let uploader = BatchUploader::new(DiscardSink)
            .with_max_batch_size(config.max_batch_size)
            .with_metrics(metrics.clone());
        (Arc::new(uploader), "discard".to_string())
    } else {
        let stream = config
            .stream_name
            .clone()
            .context("stream_name is required unless dry_run is set")?;
        let sink = FirehoseSink::from_env(stream).await;
        let name = format!("firehose:{}", sink.stream());
        let uploader = BatchUploader::new(sink)
            .with_max_batch_size(config.max_batch_size)
            .with_metrics(metrics.clone());
        (Arc::new(uploader), name)
    };

    let scanner = UsageScannerBuilder::new()
        .node_cache(node_cache)
        .uploader(uploader)
        .interval(config.scan_interval())
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .build()?;

    let (pod_subscription, pod_informer) = spawn_informer(
        Api::<Pod>::all(client),
        watcher::Config::default().fields(RUNNING_PODS_SELECTOR),
        pod_shutdown,
    );
    let scanner_handle = tokio::spawn(Arc::new(scanner).run(pod_subscription, scanner_shutdown));

    logger.log_startup(AGENT_VERSION, &sink);

    // Wait for shutdown signal
    let reason = signal_task.await.unwrap_or("signal task failed");
    logger.log_shutdown(reason);

    if let Err(e) = scanner_handle.await {
        health_registry
            .set_unhealthy(components::SCANNER, e.to_string())
            .await;
        error!(error = %e, "Usage scanner task failed");
    }
    for (name, handle) in [("node", node_informer), ("pod", pod_informer)] {
        if let Err(e) = handle.await {
            warn!(informer = name, error = %e, "Informer task failed");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

/// Client from an explicit kubeconfig, otherwise the in-cluster or default
/// configuration
async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API");
    Client::try_from(config).context("Failed to create Kubernetes client")
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
