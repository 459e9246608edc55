//! # Client Listener & Welcome Replay
//!
//! Accepts client connections, assigns each a sequential id, and replays
//! the cached world state to it in the same order a freshly (re)synced PSX
//! instance would emit it: identity, version/layout, the lexicon, the
//! first batch of instrument values, then everything else once upstream
//! has had a chance to push a fresh `START`-mode snapshot.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::connection::{ClientConnection, OutboundHandle, PROTOCOL_SEPARATOR};
use crate::context::RouterContext;

const DEFAULT_VERSION: &str = "1.0 psx-router";
const DEFAULT_LAYOUT: &str = "1";
const AWAITING_START_TIMEOUT: Duration = Duration::from_millis(1000);
const AWAITING_START_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ClientLine {
    pub client_id: u64,
    pub line: String,
    pub received_at: Instant,
}

pub async fn run(ctx: Arc<RouterContext>, to_forwarder: mpsc::UnboundedSender<ClientLine>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.listen.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "client listener bound");
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        let to_forwarder = to_forwarder.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(ctx, stream, peer, to_forwarder).await {
                tracing::debug!(%peer, error = %e, "client connection ended");
            }
        });
    }
}

async fn serve_client(
    ctx: Arc<RouterContext>,
    stream: TcpStream,
    peer: SocketAddr,
    to_forwarder: mpsc::UnboundedSender<ClientLine>,
) -> anyhow::Result<()> {
    let client_id = ctx.client_ids.next();
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = OutboundHandle::new();

    let mut client = ClientConnection::new(peer, client_id, outbound.clone());
    client.update_access_level(&ctx.config.access, None);
    let has_access_on_connect = client.has_access();

    ctx.clients.write().await.insert(client_id, client);
    tracing::info!(client_id, %peer, "client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            let bytes = format!("{line}{PROTOCOL_SEPARATOR}");
            if write_half.write_all(bytes.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    outbound.send_line(format!("id={client_id}"));
    if ctx.pause_clients_until_upstream.load(std::sync::atomic::Ordering::Relaxed) {
        outbound.send_line("load1");
    }
    if has_access_on_connect {
        run_welcome(&ctx, client_id, &outbound).await;
    }

    let mut reader = BufReader::with_capacity(ctx.read_buffer_size, read_half);
    let mut buf = String::new();
    loop {
        buf.clear();
        let bytes_read = reader.read_line(&mut buf).await?;
        if bytes_read == 0 {
            break;
        }
        let line = buf.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            continue;
        }
        let _ = to_forwarder.send(ClientLine {
            client_id,
            line,
            received_at: Instant::now(),
        });
    }

    ctx.clients.write().await.remove(&client_id);
    tracing::info!(client_id, "client disconnected");
    writer_task.abort();
    Ok(())
}

/// Replays the welcome sequence a client expects immediately after `id=`
/// and again after it crosses from no-access to having a granted level
/// (e.g. a successful FRDP `AUTH`). Synthesizes `version`/`layout` into the
/// cache on a cold start rather than leaving a welcoming client stuck
/// without either.
pub async fn run_welcome(ctx: &Arc<RouterContext>, client_id: u64, outbound: &OutboundHandle) {
    let started = Instant::now();
    let mut sent_count: u64 = 0;
    let mut sent_keywords: HashSet<String> = HashSet::new();

    {
        let mut cache = ctx.cache.lock().await;
        if !cache.has("version") {
            let _ = cache.update("version", DEFAULT_VERSION);
        }
        if !cache.has("layout") {
            let _ = cache.update("layout", DEFAULT_LAYOUT);
        }
    }

    {
        let cache = ctx.cache.lock().await;
        if let Ok(version) = cache.get_value("version") {
            outbound.send_line(format!("version={}", version.as_str()));
            sent_count += 1;
            sent_keywords.insert("version".to_string());
        }
        if let Ok(layout) = cache.get_value("layout") {
            outbound.send_line(format!("layout={}", layout.as_str()));
            sent_count += 1;
            sent_keywords.insert("layout".to_string());
        }

        for prefix in ["Ls", "Lh", "Li"] {
            let mut keys: Vec<String> = cache.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            ctx.catalog.sort_psx_keywords(&mut keys);
            for key in &keys {
                if let Ok(value) = cache.get_value(key) {
                    outbound.send_line(format!("{key}={}", value.as_str()));
                    sent_count += 1;
                    sent_keywords.insert(key.clone());
                }
            }
        }
    }

    outbound.send_line("load1");
    sent_count += 1;

    if let Some(link) = ctx.upstream.read().await.as_ref() {
        link.connection.lock().await.base.outbound.send_line("start");
    }

    {
        let mut clients = ctx.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.welcome_keywords_sent.extend(sent_keywords.drain());
            client.waiting_for_start_keywords = true;
        }
    }

    let start_keywords: HashSet<String> = ctx.catalog.keywords_with_mode("START").into_iter().collect();
    let deadline = Instant::now() + AWAITING_START_TIMEOUT;
    loop {
        let satisfied = {
            let cache = ctx.cache.lock().await;
            start_keywords.iter().all(|k| cache.has(k))
        };
        if satisfied {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(client_id, "welcome awaiting-START window expired");
            break;
        }
        tokio::time::sleep(AWAITING_START_POLL).await;
    }

    {
        let mut clients = ctx.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.waiting_for_start_keywords = false;
        }
    }

    {
        let cache = ctx.cache.lock().await;
        for i in 0..32 {
            let key = format!("Qi{i}");
            if let Ok(value) = cache.get_value(&key) {
                outbound.send_line(format!("{key}={}", value.as_str()));
                sent_count += 1;
            }
        }
    }

    outbound.send_line("load2");
    sent_count += 1;

    {
        let cache = ctx.cache.lock().await;
        for prefix in ["Qi", "Qh", "Qs"] {
            let mut keys: Vec<String> = cache.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            ctx.catalog.sort_psx_keywords(&mut keys);
            for key in keys {
                if prefix == "Qi" && qi_index_below(&key, 32) {
                    continue;
                }
                if let Ok(value) = cache.get_value(&key) {
                    outbound.send_line(format!("{key}={}", value.as_str()));
                    sent_count += 1;
                }
            }
        }
    }

    outbound.send_line("load3");
    sent_count += 1;

    {
        let cache = ctx.cache.lock().await;
        if let Ok(metar) = cache.get_value("metar") {
            outbound.send_line(format!("metar={}", metar.as_str()));
            sent_count += 1;
        }
    }

    outbound.send_line(format!(
        "name={}:{} {} {} in {}",
        ctx.config.identity.router,
        crate::upstream::ROUTER_IMPLEMENTATION_TAG,
        crate::upstream::ROUTER_DESCRIPTION,
        ctx.config.identity.router,
        ctx.config.identity.simulator,
    ));

    {
        let mut clients = ctx.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.welcome_keywords_sent.clear();
            client.welcome_sent = true;
        }
    }

    tracing::info!(
        client_id,
        keywords_sent = sent_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "welcome sequence complete"
    );
}

fn qi_index_below(key: &str, bound: u32) -> bool {
    key.strip_prefix("Qi")
        .and_then(|n| n.parse::<u32>().ok())
        .map(|n| n < bound)
        .unwrap_or(false)
}

/// Sends every connected client a fresh `load1`, the same signal a client
/// would see at the start of a resync, so nothing renders stale upstream
/// state while we're between upstream connections.
pub async fn pause_all_clients(ctx: &RouterContext) {
    let clients = ctx.clients.read().await;
    for client in clients.values() {
        client.base.outbound.send_line("load1");
    }
}
