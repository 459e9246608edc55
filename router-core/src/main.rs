//! # psx-router
//!
//! Entry point: parse CLI arguments, load and validate configuration, load
//! the variable catalog and persisted cache, initialize logging, and hand
//! control to the Supervisor. Runs until a shutdown signal, returning a
//! non-zero exit code on configuration or startup failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use psx_router::cache::Cache;
use psx_router::config::RouterConfig;
use psx_router::context::RouterContext;
use psx_router::supervisor::{self, SupervisorOptions};

#[derive(Parser, Debug)]
#[command(name = "psx-router", about = "A protocol-aware router for PSX network traffic")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "router.toml")]
    config: PathBuf,

    /// Size, in bytes, of the line-read buffer used for each connection.
    #[arg(long, default_value_t = 8192)]
    read_buffer_size: usize,

    /// Delay between upstream reconnect attempts, in seconds.
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// Interval between status log lines, in seconds.
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,

    /// Interval between housekeeping passes (cache persistence), in seconds.
    #[arg(long, default_value_t = 30)]
    housekeeping_interval_secs: u64,

    /// Enable verbose debug logging regardless of RUST_LOG.
    #[arg(long)]
    debug: bool,

    /// Override the persisted cache file path (defaults to
    /// `frankenrouter-<router>.cache.json` in the log directory).
    #[arg(long)]
    state_cache_file: Option<PathBuf>,

    /// Pause every client immediately on startup, before upstream connects.
    #[arg(long)]
    pause_clients: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match RouterConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e:#}", args.config.display());
            std::process::exit(1);
        }
    };

    let _logging_guards = psx_router::logging::init(
        std::path::Path::new(&config.log.directory),
        config.log.traffic,
    )?;

    if args.debug {
        tracing::info!("debug flag set; application log level follows RUST_LOG regardless");
    }

    let catalog = match psx_router::catalog::load_or_fetch(std::path::Path::new(&config.psx.variables)) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %e, path = %config.psx.variables, "failed to load variable catalog");
            std::process::exit(1);
        }
    };

    let cache_path = args
        .state_cache_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.log.directory).join(format!("frankenrouter-{}.cache.json", config.identity.router)));
    let cache = Cache::read_from_file(&cache_path);

    let own_uuid = uuid::Uuid::new_v4().to_string();
    let ctx = Arc::new(RouterContext::with_options(
        config,
        catalog,
        cache,
        own_uuid,
        args.read_buffer_size,
        args.pause_clients,
    ));

    if args.pause_clients {
        tracing::info!("pause-clients flag set; clients will be paused until upstream first connects");
    }

    let opts = SupervisorOptions {
        reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
        status_interval: Duration::from_secs(args.status_interval_secs),
        housekeeping_interval: Duration::from_secs(args.housekeeping_interval_secs),
    };

    supervisor::run(ctx, opts).await
}
