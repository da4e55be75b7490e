//! # jupiter_server
//!
//! Standalone HTTP+WebSocket server for jupiter. Equivalent to
//! `jupiter server`, without the rest of the CLI: argument parsing,
//! logging init, state assembly, serve.
//!
//! ```bash
//! jupiter_server --project /path/to/project --port 8765
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jupiter::api::{self, ApiCounters, ApiState};
use jupiter::config::JupiterConfig;
use jupiter::events::EventBus;
use jupiter::jobs::{JobManager, JobManagerConfig};
use jupiter::license::LicenseAdapter;
use jupiter::plugins::permissions::AuditLog;
use jupiter::plugins::{BridgeServices, PluginBridge};
use jupiter::project::ProjectManager;

#[derive(Parser, Debug)]
#[command(name = "jupiter_server")]
#[command(about = "HTTP+WebSocket API server for jupiter project introspection")]
#[command(version)]
struct Args {
    /// Project root directory.
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let root = args
        .project
        .canonicalize()
        .with_context(|| format!("bad project root {}", args.project.display()))?;
    let mut config = JupiterConfig::load(&root).context("loading configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let bus = Arc::new(EventBus::default());
    let jobs = JobManager::new(JobManagerConfig::default(), Arc::clone(&bus));
    let license = LicenseAdapter::new(config.license.clone());
    license.spawn_poller(Duration::from_secs(300));

    let bridge = PluginBridge::new(
        root.join("plugins"),
        BridgeServices {
            bus: Arc::clone(&bus),
            jobs: Arc::clone(&jobs),
            license: Arc::clone(&license),
            project_root: root.clone(),
            config: config.clone(),
        },
    );
    bridge.startup();

    let projects = Arc::new(ProjectManager::load_default());
    let _ = projects.ensure_local(&root);

    info!(root = %root.display(), "starting jupiter server");
    let state = Arc::new(ApiState {
        root: tokio::sync::RwLock::new(root.clone()),
        config: tokio::sync::RwLock::new(config),
        bus,
        jobs,
        license,
        bridge,
        projects,
        audit: AuditLog::new(&root),
        latest_graph: tokio::sync::RwLock::new(None),
        counters: ApiCounters::default(),
    });
    api::serve(state).await.context("serving API")?;
    Ok(())
}
