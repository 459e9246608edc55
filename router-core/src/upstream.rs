//! # Upstream Connector
//!
//! Owns the single outbound connection to PSX's main server (or to another
//! router acting as one). Reconnects forever on any disconnect, pausing
//! every client in between so a client never mistakes a stale world for a
//! live one. The actual socket read loop lives here; routing decisions for
//! each line are left to the Forwarder task that drains `InboundLine`s from
//! the channel below.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::connection::{OutboundHandle, UpstreamConnection, PROTOCOL_SEPARATOR};
use crate::context::RouterContext;

pub const ROUTER_IMPLEMENTATION_TAG: &str = "psx-router";
pub const ROUTER_DESCRIPTION: &str = "PSX protocol router";

/// The live upstream connection's state plus the handle used to queue
/// outbound lines to it. Held behind `RouterContext::upstream` so the
/// forwarder and the RDP scheduler can reach it without owning the socket.
pub struct UpstreamLink {
    pub connection: Mutex<UpstreamConnection>,
}

#[derive(Debug, Clone)]
pub struct InboundLine {
    pub line: String,
    pub received_at: Instant,
}

fn self_identification_line(router_identity: &str, simulator_identity: &str) -> String {
    format!(
        "name={router_identity}:{ROUTER_IMPLEMENTATION_TAG} {ROUTER_DESCRIPTION} {router_identity} in {simulator_identity}"
    )
}

/// Runs forever: connect, announce, replay demands, read lines until EOF or
/// error, then pause clients and retry after `reconnect_delay`.
pub async fn run(
    ctx: Arc<RouterContext>,
    to_forwarder: mpsc::UnboundedSender<InboundLine>,
    reconnect_delay: Duration,
) {
    loop {
        let (host, port) = ctx.upstream_target.read().await.clone();
        let target = format!("{host}:{port}");
        match TcpStream::connect(&target).await {
            Ok(stream) => {
                tracing::info!(%target, "connected to upstream");
                ctx.pause_clients_until_upstream
                    .store(false, std::sync::atomic::Ordering::Relaxed);
                if let Err(e) = serve(&ctx, stream, &to_forwarder).await {
                    tracing::warn!(%target, error = %e, "upstream connection lost");
                }
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "failed to connect to upstream");
            }
        }
        *ctx.upstream.write().await = None;
        crate::listener::pause_all_clients(&ctx).await;
        sleep(reconnect_delay).await;
    }
}

async fn serve(
    ctx: &Arc<RouterContext>,
    stream: TcpStream,
    to_forwarder: &mpsc::UnboundedSender<InboundLine>,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = OutboundHandle::new();

    let link = Arc::new(UpstreamLink {
        connection: Mutex::new(UpstreamConnection::new(peer, outbound.clone())),
    });
    *ctx.upstream.write().await = Some(link);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            let bytes = format!("{line}{PROTOCOL_SEPARATOR}");
            if write_half.write_all(bytes.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    outbound.send_line(self_identification_line(
        &ctx.config.identity.router,
        &ctx.config.identity.simulator,
    ));

    for demand in all_client_demands(ctx).await {
        outbound.send_line(format!("demand={demand}"));
    }

    let mut reader = BufReader::with_capacity(ctx.read_buffer_size, read_half);
    let mut buf = String::new();
    let result = loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }
        let line = buf.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            continue;
        }
        let _ = to_forwarder.send(InboundLine {
            line,
            received_at: Instant::now(),
        });
    };

    writer_task.abort();
    result
}

/// The union of every connected client's demanded keywords, replayed to a
/// freshly (re)connected upstream so it starts sending everything clients
/// have asked for.
async fn all_client_demands(ctx: &RouterContext) -> Vec<String> {
    let clients = ctx.clients.read().await;
    let mut demands: Vec<String> = clients
        .values()
        .flat_map(|c| c.demands.iter().cloned())
        .collect();
    demands.sort();
    demands.dedup();
    demands
}
