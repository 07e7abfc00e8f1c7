//! Modhub daemon - runs the cleanup scheduler and change watcher.
//!
//! Registration traffic reaches the hub through the library API; this binary
//! keeps the registry consistent in the background and logs KV changes.

use anyhow::Result;
use clap::Parser;
use modhub_core::{ChangeEvent, HubConfig, InMemoryBackend, ModuleHub};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "modhub-daemon")]
#[command(about = "Module registry consistency daemon")]
struct Args {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Consul agent host
    #[arg(long)]
    consul_host: Option<String>,

    /// Consul agent port
    #[arg(long)]
    consul_port: Option<u16>,

    /// Run against an in-process store instead of Consul
    #[arg(long)]
    in_memory: bool,

    /// Disable the periodic zombie cleanup
    #[arg(long)]
    no_cleanup: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting modhub daemon");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            HubConfig::load(path)?
        }
        None => HubConfig::default(),
    };
    if let Some(host) = args.consul_host {
        config.consul.host = host;
    }
    if let Some(port) = args.consul_port {
        config.consul.port = port;
    }
    if args.no_cleanup {
        config.cleanup_enabled = false;
    }

    let mut builder = ModuleHub::builder(config);
    if args.in_memory {
        warn!("Using in-memory store; nothing is persisted");
        builder = builder.with_backend(Arc::new(InMemoryBackend::new()));
    }
    let hub = builder.build()?;

    let mut events = hub.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    hub.start();
    info!(
        "Watching {} (cluster {})",
        hub.config().normalized_prefix(),
        hub.config().cluster_name
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    hub.shutdown();
    logger.abort();

    Ok(())
}

fn log_event(event: &ChangeEvent) {
    match event {
        ChangeEvent::PipelineDefinitionChanged { pipeline_id, .. } => {
            info!("Pipeline definition changed: {}", pipeline_id)
        }
        ChangeEvent::ModuleRegistrationChanged { module_id, .. } => {
            info!("Module registration changed: {}", module_id)
        }
        ChangeEvent::ClusterPipelineChanged {
            cluster,
            pipeline_id,
            ..
        } => info!("Pipeline {} changed in cluster {}", pipeline_id, cluster),
    }
    debug!("Event payload: {}", event.value());
}
