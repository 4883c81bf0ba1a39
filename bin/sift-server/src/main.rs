//! Sift Server
//!
//! Boots one node: loads configuration, assigns the node identity, opens
//! the metadata store and the index registry, then serves until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use sift_common::Config;
use sift_common::config::ServerMode;
use sift_index::Registry;
use sift_meta_store::{MetaStore, keys, set_json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often index usage is logged
const USAGE_REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Control-record domain holding each instance's latest usage
const USAGE_DOMAIN: &str = "usage";

#[derive(Parser, Debug)]
#[command(name = "sift-server")]
#[command(about = "Sift search engine node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sift/sift.toml")]
    config: PathBuf,

    /// Data directory (overrides server.data_path)
    #[arg(long, env = "SIFT_DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Node number for ID generation (overrides server.node_id)
    #[arg(long, env = "SIFT_NODE_ID")]
    node_id: Option<u16>,

    /// Deployment mode: standalone or cluster (overrides server.mode)
    #[arg(long)]
    mode: Option<ServerMode>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(data_path) = &args.data_path {
        config.server.data_path.clone_from(data_path);
    }
    if let Some(node_id) = args.node_id {
        config.server.node_id = node_id;
    }
    if let Some(mode) = args.mode {
        config.server.mode = mode;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Log usage and record it under `/usage/{instance_id}`
async fn report_usage(registry: &Registry, store: &dyn MetaStore, instance_id: &str) {
    let usage = registry.usage();
    info!(
        "Usage: indices={}, documents={}, size={:.2} MB",
        usage.index_count, usage.doc_count, usage.total_index_size_mb
    );
    for (name, reason) in registry.unavailable() {
        warn!("Index {} unavailable: {}", name, reason);
    }

    let key = keys::control(USAGE_DOMAIN, instance_id);
    if let Err(e) = set_json(store, &key, &usage).await {
        if e.is_io() {
            warn!("Metadata store unreachable, usage not recorded: {}", e);
        } else {
            error!("Failed to record usage: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    info!("Starting Sift server");
    info!("Config file: {}", args.config.display());
    info!(
        "Mode: {:?}, data path: {}, node: {}",
        config.server.mode,
        config.server.data_path.display(),
        config.server.node_id
    );

    let node = sift_common::ider::install(config.server.node_id)?;
    let store = sift_meta_store::open(&config)?;
    let instance_id = sift_meta_store::instance_id(store.as_ref(), &node).await?;
    info!("Instance ID: {}", instance_id);

    let registry = Arc::new(Registry::open(config, Arc::clone(&store), node).await?);
    report_usage(&registry, store.as_ref(), &instance_id).await;

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let reporter = {
        let registry = Arc::clone(&registry);
        let store = Arc::clone(&store);
        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(USAGE_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        report_usage(&registry, store.as_ref(), &instance_id).await;
                    }
                }
            }
        })
    };

    info!("Sift server ready");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    shutdown.send_replace(true);
    if let Err(e) = reporter.await {
        warn!("Usage reporter ended abnormally: {}", e);
    }

    let mut clean = true;
    if let Err(e) = registry.close_all().await {
        error!("Failed to close indices: {}", e);
        clean = false;
    }
    if let Err(e) = store.close().await {
        error!("Failed to close metadata store: {}", e);
        clean = false;
    }

    if clean {
        info!("Sift server shut down gracefully");
        Ok(())
    } else {
        anyhow::bail!("shutdown completed with errors")
    }
}
