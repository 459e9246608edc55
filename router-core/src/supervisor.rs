//! # Supervisor
//!
//! Spawns every long-running task, waits for either a shutdown signal or
//! one of them exiting unexpectedly, then runs the shutdown sequence.
//! Equivalent to the way the rest of this codebase launches a list of
//! subsystems and joins them, generalized from blocking `JoinHandle::join`
//! over OS threads to polling async `JoinHandle`s so the monitor loop
//! doesn't need a separate self-referential task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::RouterContext;
use crate::{control_api, forwarder, listener, rdp, upstream};

pub struct SupervisorOptions {
    pub reconnect_delay: Duration,
    pub status_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            status_interval: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

pub async fn run(ctx: Arc<RouterContext>, opts: SupervisorOptions) -> anyhow::Result<()> {
    let (to_upstream_forwarder, from_upstream_rx) = mpsc::unbounded_channel();
    let (to_client_forwarder, from_clients_rx) = mpsc::unbounded_channel();

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    tasks.push((
        "Upstream Connector",
        tokio::spawn(upstream::run(ctx.clone(), to_upstream_forwarder, opts.reconnect_delay)),
    ));
    tasks.push((
        "Client Listener",
        tokio::spawn(run_listener(ctx.clone(), to_client_forwarder)),
    ));
    tasks.push((
        "Forward-From-Upstream",
        tokio::spawn(forwarder::run_from_upstream(ctx.clone(), from_upstream_rx)),
    ));
    tasks.push((
        "Forward-From-Clients",
        tokio::spawn(forwarder::run_from_clients(ctx.clone(), from_clients_rx)),
    ));
    tasks.push(("RDP Scheduler", tokio::spawn(rdp::run(ctx.clone()))));
    tasks.push((
        "Status Display",
        tokio::spawn(status_display(ctx.clone(), opts.status_interval)),
    ));
    tasks.push((
        "Housekeeping",
        tokio::spawn(housekeeping(ctx.clone(), opts.housekeeping_interval)),
    ));

    let control_api_thread = ctx
        .config
        .listen
        .rest_api_port
        .map(|port| control_api::spawn(ctx.clone(), port));

    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|(name, handle)| async move { (name, handle.await) })
        .collect();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        Some((name, result)) = pending.next() => {
            tracing::error!(task = name, ?result, "task exited unexpectedly, shutting down");
        }
    }

    graceful_shutdown(&ctx).await;

    if let Some(handle) = control_api_thread {
        drop(handle);
    }

    Ok(())
}

async fn run_listener(ctx: Arc<RouterContext>, to_forwarder: mpsc::UnboundedSender<listener::ClientLine>) {
    if let Err(e) = listener::run(ctx, to_forwarder).await {
        tracing::error!(error = %e, "client listener exited");
    }
}

async fn status_display(ctx: Arc<RouterContext>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let client_count = ctx.clients.read().await.len();
        let upstream_connected = ctx.upstream.read().await.is_some();
        let uptime_secs = ctx.started_at.elapsed().as_secs();
        tracing::info!(client_count, upstream_connected, uptime_secs, "router status");
    }
}

async fn housekeeping(ctx: Arc<RouterContext>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let path = cache_file_path(&ctx);
        let cache = ctx.cache.lock().await;
        if let Err(e) = cache.write_to_file(&path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to persist cache");
        }
    }
}

fn cache_file_path(ctx: &RouterContext) -> PathBuf {
    PathBuf::from(&ctx.config.log.directory).join(format!(
        "frankenrouter-{}.cache.json",
        ctx.config.identity.router
    ))
}

/// Pauses every client, tells each one (and upstream) to `exit`, then
/// persists the cache one last time.
async fn graceful_shutdown(ctx: &Arc<RouterContext>) {
    tracing::info!("shutting down: pausing clients");
    listener::pause_all_clients(ctx).await;

    {
        let clients = ctx.clients.read().await;
        for client in clients.values() {
            client.base.outbound.send_line("exit");
        }
    }

    if let Some(link) = ctx.upstream.read().await.as_ref() {
        link.connection.lock().await.base.outbound.send_line("exit");
    }

    let path = cache_file_path(ctx);
    let cache = ctx.cache.lock().await;
    if let Err(e) = cache.write_to_file(&path) {
        tracing::warn!(error = %e, path = %path.display(), "failed to persist cache on shutdown");
    }
}
