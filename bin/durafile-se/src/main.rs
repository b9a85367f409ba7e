//! Durafile SE - Storage element daemon
//!
//! Runs the lifecycle core of one storage element replica: finalize
//! recovery, incremental cache rebuild, garbage collection and capacity
//! monitoring, plus a Prometheus `/metrics` and `/health` endpoint.

use anyhow::Result;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use durafile_common::config::BackendKind;
use durafile_common::{Clock, Config, SystemClock};
use durafile_coord::MemoryCoordinationStore;
use durafile_element::{CapacityHealth, RebuildMode, StorageElement};
use durafile_meta_store::{MetaStore, MetadataStore};
use durafile_storage::{FilesystemBackend, MemoryBackend, StorageBackend};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "durafile-se")]
#[command(about = "Durafile storage element daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/durafile/se.toml")]
    config: String,

    /// Storage element identifier
    #[arg(long)]
    element_id: Option<String>,

    /// Replica identity used for leases
    #[arg(long)]
    replica_id: Option<String>,

    /// Directory for the metadata database
    #[arg(long)]
    data_dir: Option<String>,

    /// Storage backend: filesystem or memory
    #[arg(long)]
    backend: Option<String>,

    /// Root directory of the filesystem backend
    #[arg(long)]
    storage_root: Option<String>,

    /// Metrics listen address (Prometheus)
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence over the config file
    if let Some(id) = &args.element_id {
        config.node.element_id = id.clone();
    }
    if let Some(id) = &args.replica_id {
        config.node.replica_id = id.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.node.data_dir = PathBuf::from(dir);
    }
    if let Some(backend) = &args.backend {
        config.storage.backend = match backend.as_str() {
            "filesystem" => BackendKind::Filesystem,
            "memory" => BackendKind::Memory,
            other => anyhow::bail!("Unknown backend '{}': expected filesystem or memory", other),
        };
    }
    if let Some(root) = &args.storage_root {
        config.storage.root = PathBuf::from(root);
    }
    if let Some(listen) = &args.metrics_listen {
        config.metrics.listen = listen.clone();
    }
    if args.log_level != "info" {
        config.logging.level = args.log_level.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        BackendKind::Filesystem => Arc::new(FilesystemBackend::new(&config.storage.root).await?),
        BackendKind::Memory => Arc::new(MemoryBackend::new(config.storage.memory_quota_bytes)),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting durafile storage element");
    info!("Config file: {}", args.config);
    info!(
        "Element {} replica {} (cluster {})",
        config.node.element_id, config.node.replica_id, config.node.cluster
    );

    let backend = open_backend(&config).await?;
    let meta_path = config.node.data_dir.join("meta.redb");
    info!("Metadata database: {}", meta_path.display());
    let meta: Arc<dyn MetadataStore> = Arc::new(MetaStore::open(&meta_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // Single-process deployment. Replicas on several hosts must share both
    // stores, so they plug shared CoordinationStore and MetadataStore
    // implementations in here
    let coordination = Arc::new(MemoryCoordinationStore::new());

    let element = Arc::new(StorageElement::new(
        config.clone(),
        backend,
        meta.clone(),
        coordination,
        clock,
    )?);

    if meta.cache_row_count()? == 0 {
        info!("Metadata cache is empty, rebuilding from descriptors");
        match element.rebuild_engine().rebuild(RebuildMode::Full).await {
            Ok(report) => info!("Initial rebuild cached {} files", report.upserted),
            Err(e) => warn!("Initial rebuild failed: {} (incremental rebuild will retry)", e),
        }
    }

    let tasks = element.spawn_background();

    let metrics_addr: SocketAddr = config.metrics.listen.parse().map_err(|e| {
        anyhow::anyhow!("Invalid metrics listen address {}: {}", config.metrics.listen, e)
    })?;
    let metrics_element = element.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr, metrics_element).await {
            error!("Metrics server error: {}", e);
        }
    });
    info!("Metrics available at http://{}/metrics", metrics_addr);

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    element.shutdown(tasks).await;
    metrics_handle.abort();

    info!("Storage element shut down gracefully");
    Ok(())
}

/// Metrics HTTP handler
async fn metrics_handler(State(element): State<Arc<StorageElement>>) -> impl IntoResponse {
    let output = element.metrics().export_prometheus(element.element_id());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Health check handler, reflecting capacity health
async fn health_handler(State(element): State<Arc<StorageElement>>) -> impl IntoResponse {
    match element.capacity_monitor().current().await {
        Ok(snapshot) => match snapshot.health {
            CapacityHealth::Ok => (StatusCode::OK, "OK"),
            CapacityHealth::Warning => (StatusCode::OK, "WARNING"),
            CapacityHealth::Critical => (StatusCode::SERVICE_UNAVAILABLE, "CRITICAL"),
        },
        Err(e) => {
            warn!("Health check without capacity reading: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
        }
    }
}

/// Start the metrics HTTP server
async fn start_metrics_server(addr: SocketAddr, element: Arc<StorageElement>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(element);

    info!("Starting metrics server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let args = Args::parse_from([
            "durafile-se",
            "--config",
            "/nonexistent/se.toml",
            "--element-id",
            "se-7",
            "--backend",
            "memory",
            "--log-level",
            "debug",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.node.element_id, "se-7");
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.metrics.listen, "0.0.0.0:9301");
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let args = Args::parse_from(["durafile-se", "--config", "/nonexistent", "--backend", "s3"]);
        assert!(load_config(&args).is_err());
    }
}
