//! # Router Context
//!
//! Everything the running router needs, owned once by the Supervisor and
//! handed to tasks as shared references instead of being reachable through
//! global singletons. Fields that multiple tasks mutate concurrently are
//! wrapped individually so a reader of one field never blocks on another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};

use std::sync::Arc;

use crate::cache::Cache;
use crate::catalog::Catalog;
use crate::config::RouterConfig;
use crate::connection::ClientConnection;
use crate::upstream::UpstreamLink;

/// Cross-router state exchanged via FRDP `sharedinfo`/`routerinfo` verbs
/// between two linked routers, e.g. which simulator currently has the
/// flying pilot's controls.
#[derive(Debug, Clone, Default)]
pub struct SharedInfo {
    pub pilot_flying_simulator: Option<String>,
    pub master_uuid: Option<String>,
    pub peer_uuid: Option<String>,
    pub peer_routerinfo_received_at: Option<Instant>,
    /// Set by the Rule Engine when a FLIGHTCONTROLS-family verb changes
    /// `pilot_flying_simulator`; consumed by the RDP scheduler's next tick,
    /// which disseminates a fresh SHAREDINFO addon message and clears it.
    pub sharedinfo_reemit_pending: bool,
}

/// Monotonically increasing client identifiers, handed out as clients
/// connect. Kept separate from the clients map so a listener task can
/// reserve an id before it has inserted the connection. Starts at 1,
/// matching `frankenrouter.py`'s `next_client_id`.
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl ClientIdAllocator {
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// State shared across every task: the listener, the forwarders, the RDP
/// scheduler, the control API, and the housekeeping loop.
pub struct RouterContext {
    pub config: RouterConfig,
    pub catalog: Catalog,
    pub cache: Mutex<Cache>,
    pub clients: RwLock<HashMap<u64, ClientConnection>>,
    pub client_ids: ClientIdAllocator,
    pub sharedinfo: Mutex<SharedInfo>,
    pub own_uuid: String,
    pub last_load1: Mutex<Option<Instant>>,
    pub last_load3: Mutex<Option<Instant>>,
    pub started_at: Instant,
    /// Size, in bytes, of the line-read buffer used for each connection.
    pub read_buffer_size: usize,
    /// Set at startup by `--pause-clients`; a freshly accepted client is
    /// immediately paused (`load1`) while this is true. Cleared the moment
    /// upstream connects for the first time.
    pub pause_clients_until_upstream: AtomicBool,
    /// The single upstream link, if currently connected. `None` between a
    /// drop and the next successful reconnect.
    pub upstream: RwLock<Option<Arc<UpstreamLink>>>,
    /// Host/port the Upstream Connector dials. Split out from `config` so
    /// the control API can redirect it without touching the rest of the
    /// validated configuration.
    pub upstream_target: RwLock<(String, u16)>,
}

impl RouterContext {
    pub fn new(config: RouterConfig, catalog: Catalog, cache: Cache, own_uuid: String) -> Self {
        Self::with_options(config, catalog, cache, own_uuid, 8192, false)
    }

    pub fn with_options(
        config: RouterConfig,
        catalog: Catalog,
        cache: Cache,
        own_uuid: String,
        read_buffer_size: usize,
        pause_clients_until_upstream: bool,
    ) -> Self {
        let upstream_target = (config.upstream.host.clone(), config.upstream.port);
        Self {
            config,
            catalog,
            cache: Mutex::new(cache),
            clients: RwLock::new(HashMap::new()),
            client_ids: ClientIdAllocator::default(),
            sharedinfo: Mutex::new(SharedInfo::default()),
            own_uuid,
            last_load1: Mutex::new(None),
            last_load3: Mutex::new(None),
            started_at: Instant::now(),
            read_buffer_size,
            pause_clients_until_upstream: AtomicBool::new(pause_clients_until_upstream),
            upstream: RwLock::new(None),
            upstream_target: RwLock::new(upstream_target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_increase_monotonically() {
        let alloc = ClientIdAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }
}
