//! VibeBus - Clustered publish/subscribe message service
//!
//! Usage:
//!   vibebus [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -n, --node-id <ID>        Cluster node id (default: hostname)
//!   --metrics-bind <ADDR>     Serve Prometheus metrics on this address
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vibebus::adapter::InMemoryAdapter;
use vibebus::broker::MessageService;
use vibebus::cluster::ClusterManager;
use vibebus::config::Config;
use vibebus::metrics::{Metrics, MetricsServer};
use vibebus::remote::{ClusterEventCallback, ClusterTransport};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// VibeBus - Clustered publish/subscribe message service
#[derive(Parser, Debug)]
#[command(name = "vibebus")]
#[command(author = "VibeBus Contributors")]
#[command(version)]
#[command(about = "Clustered publish/subscribe message service")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster node id, overriding the config file
    #[arg(short, long)]
    node_id: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // CLI level first, then the config file's
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::default(),
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(node_id) = args.node_id {
        if let Some(cluster) = file_config.cluster.first_mut() {
            cluster.node_id = Some(node_id);
        }
    }
    if let Some(bind) = args.metrics_bind {
        file_config.metrics.enabled = true;
        file_config.metrics.bind = bind;
    }

    info!("Starting VibeBus message service '{}'", file_config.service.id);
    info!(
        "  Subtopic separator: '{}'",
        file_config.service.subtopic_separator
    );
    info!(
        "  Client queue capacity: {}",
        file_config.service.outbound_queue_capacity
    );

    let metrics = file_config
        .metrics
        .enabled
        .then(|| Arc::new(Metrics::new()));
    let mut service = MessageService::new(&file_config.service);
    if let Some(ref metrics) = metrics {
        service = service.with_metrics(metrics.clone());
    }
    let service = Arc::new(service);

    for destination in &file_config.destinations {
        info!(
            "  Destination '{}': routing={:?} clustered={}",
            destination.id, destination.routing_mode, destination.clustered
        );
        service.add_destination(destination.clone(), Arc::new(InMemoryAdapter))?;
    }

    // Setup clustering if configured
    let cluster_manager = match file_config.cluster() {
        Some(cluster_cfg) => {
            info!(
                "  Cluster: enabled (gossip={}, peer={})",
                cluster_cfg.gossip_addr, cluster_cfg.peer_addr
            );
            if !cluster_cfg.seeds.is_empty() {
                info!("    Seeds: {}", cluster_cfg.seeds.join(", "));
            }

            let events: ClusterEventCallback = {
                let service = service.clone();
                Arc::new(move |event| service.handle_cluster_event(event))
            };
            let manager = match ClusterManager::new(cluster_cfg.clone(), events).await {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    eprintln!("Error initializing cluster: {}", e);
                    std::process::exit(1);
                }
            };
            manager.start().await?;
            let transport: Arc<dyn ClusterTransport> = manager.clone();
            service.attach_cluster(transport, cluster_cfg.sync_policy());
            Some(manager)
        }
        None => {
            info!("  Cluster: disabled");
            None
        }
    };

    let ready = Arc::new(AtomicBool::new(false));
    if let Some(ref metrics) = metrics {
        info!("  Metrics: enabled (http://{})", file_config.metrics.bind);
        let metrics_server =
            MetricsServer::new(metrics.clone(), file_config.metrics.bind, ready.clone());
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    service.start().await;
    ready.store(true, Ordering::Release);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    ready.store(false, Ordering::Release);
    service.stop();
    if let Some(manager) = cluster_manager {
        manager.stop().await;
    }

    Ok(())
}
