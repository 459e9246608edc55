//! End-to-end fixtures driving the listener, forwarders, upstream connector
//! and RDP scheduler together over real loopback sockets, the way a client
//! or a peer router actually would.

use std::sync::Arc;
use std::time::Duration;

use psx_router::cache::Cache;
use psx_router::catalog::Catalog;
use psx_router::config::RouterConfig;
use psx_router::context::{RouterContext, SharedInfo};
use psx_router::{forwarder, listener, rdp, upstream};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;

const SHORT_WAIT: Duration = Duration::from_secs(2);

fn config(extra: &str, listen_port: u16, upstream_port: u16) -> RouterConfig {
    let toml = format!(
        "[log]\ndirectory = '.'\n\n[listen]\nport = {listen_port}\n\n[upstream]\nhost = '127.0.0.1'\nport = {upstream_port}\n\n{extra}"
    );
    RouterConfig::from_str(&toml).expect("test config should parse")
}

fn build_ctx(config: RouterConfig, catalog: Catalog, cache: Cache) -> Arc<RouterContext> {
    Arc::new(RouterContext::new(config, catalog, cache, "test-router-uuid".to_string()))
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
    let mut buf = String::new();
    reader.read_line(&mut buf).await.expect("read_line failed");
    buf.trim_end_matches(['\r', '\n']).to_string()
}

/// Reads one line, failing the test if none arrives within `within`.
async fn expect_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>, within: Duration) -> String {
    timeout(within, read_line(reader))
        .await
        .unwrap_or_else(|_| panic!("timed out after {within:?} waiting for a line"))
}

/// Waits up to `within` for a line; returns `None` if nothing arrives, which
/// is the expected outcome for assertions that a filtered update never made
/// it through.
async fn line_within<R: AsyncRead + Unpin>(reader: &mut BufReader<R>, within: Duration) -> Option<String> {
    timeout(within, read_line(reader)).await.ok()
}

/// Scenario 1: cold start, no upstream. A client gets exactly the minimal
/// welcome plus the unconditional trailing self-identification (the only
/// deviation from the old Python router's wire format: it never announced
/// itself to an unidentified client, but spec.md's welcome sequence always
/// ends with step 11 regardless of sender, so a router is discoverable to
/// any peer, not just ones that spoke first).
#[tokio::test]
async fn cold_start_with_no_upstream_sends_minimal_welcome() {
    let ctx = build_ctx(config("", 19101, 19191), Catalog::parse("").unwrap(), Cache::new());

    let (client_tx, _client_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(listener::run(ctx.clone(), client_tx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(("127.0.0.1", 19101)).await.unwrap();
    let mut reader = BufReader::new(stream);

    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "id=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "version=1.0 psx-router");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "layout=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load2");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load3");
    assert!(expect_line(&mut reader, SHORT_WAIT).await.starts_with("name="));
}

/// Scenario 2: warm start, upstream connected. A pre-seeded cache is
/// replayed in the documented order, grouped by prefix within each load
/// bracket (`Ls*`/`Lh*`/`Li*` for the lexicon, `Qi*`/`Qh*`/`Qs*` for the rest).
#[tokio::test]
async fn warm_start_replays_cache_grouped_by_prefix() {
    let listen_port = 19102;
    let upstream_port = 19192;

    let mut cache = Cache::new();
    cache.update("Ls0", "foo").unwrap();
    cache.update("Li5", "bar").unwrap();
    cache.update("Qi0", "10").unwrap();
    cache.update("Qs10", "a;b;c").unwrap();
    cache.update("version", "10.182 NG").unwrap();
    cache.update("layout", "1").unwrap();
    cache.update("metar", "KORD 12Z").unwrap();

    let ctx = build_ctx(config("", listen_port, upstream_port), Catalog::parse("").unwrap(), cache);

    let fake_upstream = TcpListener::bind(("127.0.0.1", upstream_port)).await.unwrap();
    let (up_tx, up_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(upstream::run(ctx.clone(), up_tx, Duration::from_secs(60)));
    tokio::spawn(forwarder::run_from_upstream(ctx.clone(), up_rx));
    let (fake_stream, _) = fake_upstream.accept().await.unwrap();
    let mut up_reader = BufReader::new(fake_stream);
    assert!(expect_line(&mut up_reader, SHORT_WAIT).await.starts_with("name="));

    let (client_tx, _client_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(listener::run(ctx.clone(), client_tx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let mut reader = BufReader::new(stream);

    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "id=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "version=10.182 NG");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "layout=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Ls0=foo");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Li5=bar");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load1");
    assert_eq!(expect_line(&mut up_reader, SHORT_WAIT).await, "start");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Qi0=10");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load2");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Qs10=a;b;c");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load3");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "metar=KORD 12Z");
    assert!(expect_line(&mut reader, SHORT_WAIT).await.starts_with("name="));
}

/// Scenario 3: `nolong` toggles whether a client receives keywords in the
/// catalog's NOLONG augmentation set.
#[tokio::test]
async fn nolong_toggle_blocks_then_restores_delivery() {
    let listen_port = 19103;
    let upstream_port = 19193;

    let mut cache = Cache::new();
    cache.update("Qs411", "longstring").unwrap();
    let catalog = Catalog::parse("Qs411=\"CduRteCa\"; Mode=ECON; Min=15; Max=50000;\n").unwrap();

    let ctx = build_ctx(config("", listen_port, upstream_port), catalog, cache);

    let fake_upstream = TcpListener::bind(("127.0.0.1", upstream_port)).await.unwrap();
    let (up_tx, up_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(upstream::run(ctx.clone(), up_tx, Duration::from_secs(60)));
    tokio::spawn(forwarder::run_from_upstream(ctx.clone(), up_rx));
    let (fake_stream, _) = fake_upstream.accept().await.unwrap();
    let (up_read, mut up_write) = fake_stream.into_split();
    let mut up_reader = BufReader::new(up_read);
    assert!(expect_line(&mut up_reader, SHORT_WAIT).await.starts_with("name="));

    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(listener::run(ctx.clone(), client_tx));
    tokio::spawn(forwarder::run_from_clients(ctx.clone(), client_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "id=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "version=1.0 psx-router");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "layout=1");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load1");
    assert_eq!(expect_line(&mut up_reader, SHORT_WAIT).await, "start");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load2");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Qs411=longstring");
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "load3");
    assert!(expect_line(&mut reader, SHORT_WAIT).await.starts_with("name="));

    write_half.write_all(b"nolong\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    up_write.write_all(b"Qs411=other\r\n").await.unwrap();
    let blocked = line_within(&mut reader, Duration::from_millis(300)).await;
    assert!(blocked.is_none(), "nolong client must not observe a NOLONG update");

    write_half.write_all(b"nolong\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    up_write.write_all(b"Qs411=third\r\n").await.unwrap();
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "Qs411=third");
}

/// Scenario 4: two peered routers exchange RDP PING/PONG on the fixed
/// period and record exactly one RTT sample per round trip.
#[tokio::test]
async fn rdp_ping_pong_round_trip_records_one_rtt_sample() {
    let listen_port = 19104;
    let upstream_port = 19194;

    let ctx = build_ctx(config("", listen_port, upstream_port), Catalog::parse("").unwrap(), Cache::new());

    let fake_upstream = TcpListener::bind(("127.0.0.1", upstream_port)).await.unwrap();
    let (up_tx, up_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(upstream::run(ctx.clone(), up_tx, Duration::from_secs(60)));
    tokio::spawn(forwarder::run_from_upstream(ctx.clone(), up_rx));
    tokio::spawn(rdp::run(ctx.clone()));

    let (fake_stream, _) = fake_upstream.accept().await.unwrap();
    let (up_read, mut up_write) = fake_stream.into_split();
    let mut up_reader = BufReader::new(up_read);

    assert!(expect_line(&mut up_reader, SHORT_WAIT).await.starts_with("name="));
    up_write.write_all(b"name=peer:psx-router router\r\n").await.unwrap();

    // The peer may register as a router just after a tick has already
    // fired, pushing the first PING to the tick after next; allow for two
    // full periods of slack rather than just one.
    let ping_line = expect_line(&mut up_reader, Duration::from_secs(12)).await;
    assert!(ping_line.starts_with("addon=FRANKENROUTER:1:PING:"));
    let request_id = ping_line.rsplit(':').next().unwrap().to_string();

    up_write
        .write_all(format!("addon=FRANKENROUTER:1:PONG:{request_id}\r\n").as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let link = ctx.upstream.read().await.clone().expect("upstream should be connected");
    let conn = link.connection.lock().await;
    assert_eq!(conn.base.frdp_ping_rtts.len(), 1);
}

/// Scenario 5: an access rule gated on `match_password` withholds the
/// welcome sequence until FRDP `AUTH` succeeds; a wrong password closes
/// the connection instead of leaving it stuck unauthenticated.
#[tokio::test]
async fn auth_gate_withholds_welcome_until_correct_password() {
    let listen_port = 19105;
    let upstream_port = 19195;
    let extra = "[[access]]\ndisplay_name = 'secret holder'\nmatch_password = 'secret'\nlevel = 'full'\n";

    let ctx = build_ctx(config(extra, listen_port, upstream_port), Catalog::parse("").unwrap(), Cache::new());

    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(listener::run(ctx.clone(), client_tx));
    tokio::spawn(forwarder::run_from_clients(ctx.clone(), client_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "id=1");

    write_half.write_all(b"addon=FRANKENROUTER:1:AUTH:wrong\r\n").await.unwrap();
    assert_eq!(expect_line(&mut reader, SHORT_WAIT).await, "exit");

    let stream2 = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let (read_half2, mut write_half2) = stream2.into_split();
    let mut reader2 = BufReader::new(read_half2);
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "id=2");

    write_half2.write_all(b"addon=FRANKENROUTER:1:AUTH:secret\r\n").await.unwrap();
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "version=1.0 psx-router");
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "layout=1");
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "load1");
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "load2");
    assert_eq!(expect_line(&mut reader2, SHORT_WAIT).await, "load3");
    assert!(expect_line(&mut reader2, SHORT_WAIT).await.starts_with("name="));
}

/// Scenario 6: a flight-control keyword from a client is dropped while
/// another simulator holds the controls, and resumes once the shared state
/// is released to `NO_CONTROL_LOCKS`.
#[tokio::test]
async fn flight_control_lockout_blocks_then_allows_after_unlock() {
    let listen_port = 19106;
    let upstream_port = 19196;
    let extra = "[psx]\nfilter_flight_controls = true\n";

    let ctx = build_ctx(config(extra, listen_port, upstream_port), Catalog::parse("").unwrap(), Cache::new());

    let fake_upstream = TcpListener::bind(("127.0.0.1", upstream_port)).await.unwrap();
    let (up_tx, up_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(upstream::run(ctx.clone(), up_tx, Duration::from_secs(60)));
    tokio::spawn(forwarder::run_from_upstream(ctx.clone(), up_rx));
    let (fake_stream, _) = fake_upstream.accept().await.unwrap();
    let mut up_reader = BufReader::new(fake_stream);
    assert!(expect_line(&mut up_reader, SHORT_WAIT).await.starts_with("name="));

    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(listener::run(ctx.clone(), client_tx));
    tokio::spawn(forwarder::run_from_clients(ctx.clone(), client_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    for _ in 0..7 {
        expect_line(&mut reader, SHORT_WAIT).await; // drain the cold-start welcome
    }
    assert_eq!(expect_line(&mut up_reader, SHORT_WAIT).await, "start");

    *ctx.sharedinfo.lock().await = SharedInfo {
        pilot_flying_simulator: Some("OtherSim".to_string()),
        ..Default::default()
    };

    write_half.write_all(b"Qs120=5\r\n").await.unwrap();
    let blocked = line_within(&mut up_reader, Duration::from_millis(300)).await;
    assert!(blocked.is_none(), "upstream must not observe a locked-out flight control update");

    ctx.sharedinfo.lock().await.pilot_flying_simulator = Some("NO_CONTROL_LOCKS".to_string());
    write_half.write_all(b"Qs120=6\r\n").await.unwrap();
    assert_eq!(expect_line(&mut up_reader, SHORT_WAIT).await, "Qs120=6");
}
