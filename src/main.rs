use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod error;
mod gate;
mod observability;
mod proxy;

use config::Config;
use gate::VisitorRegistry;
use observability::{ActivityLogger, MetricsCollector};
use proxy::BrowsingProxy;

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(name = "browsing-proxy")]
#[command(about = "A link-rewriting browsing proxy")]
struct Args {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    #[arg(short, long)]
    validate_config: bool,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // A missing default config file means "run with defaults"; an explicit
    // path must exist.
    let use_defaults = args.config == DEFAULT_CONFIG && !Path::new(DEFAULT_CONFIG).exists();
    let mut config = if use_defaults {
        Config::default()
    } else {
        Config::load(&args.config).await?
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    observability::init_tracing(&config.logging)?;
    info!("Starting browsing proxy");

    if use_defaults {
        warn!("Config file {} not found, using defaults", DEFAULT_CONFIG);
    }

    if args.validate_config {
        config.validate()?;
        info!("Configuration is valid");
        return Ok(());
    }

    let metrics_collector = Arc::new(MetricsCollector::new(&config.metrics)?);
    let activity_logger = Arc::new(ActivityLogger::new(&config.activity_log)?);
    let visitor_registry = Arc::new(VisitorRegistry::new(&config.visitors)?);

    // Periodically forget idle visitors so rotating fingerprints cannot grow
    // the registry without bound.
    let cleanup_task = {
        let registry = visitor_registry.clone();
        let mut interval = tokio::time::interval(config.visitors.cleanup_interval);
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.cleanup_idle_visitors();
                if removed > 0 {
                    info!("Removed {} idle visitors", removed);
                }
            }
        })
    };

    let proxy = Arc::new(BrowsingProxy::new(
        &config,
        visitor_registry.clone(),
        activity_logger.clone(),
        metrics_collector,
    )?);

    proxy.start().await?;
    cleanup_task.abort();

    info!("Visitors: {}", visitor_registry.get_statistics());
    info!("Activity log: {}", activity_logger.get_statistics().await);
    info!("Browsing proxy shutdown complete");
    Ok(())
}
