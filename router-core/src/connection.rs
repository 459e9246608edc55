//! # Connection
//!
//! State kept for every peer speaking the PSX line protocol to us, whether
//! that's a client (downstream) or the single upstream link. Actual socket
//! I/O lives in `listener.rs` and `upstream.rs`; a `Connection` here is the
//! state record plus a handle (`OutboundHandle`) other tasks use to queue a
//! line for that peer's writer loop, so nothing needs a back-pointer into
//! the task that owns the socket.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::AccessRule;

pub const PROTOCOL_SEPARATOR: &str = "\r\n";

/// How a peer's display name was learned, kept so later messages only
/// overwrite a name that came from a lower-priority source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayNameSource {
    Unknown,
    AccessConfig,
    NameMessage,
    FrdpIdent,
    FrdpClientInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Full,
    Observer,
    Blocked,
    NoAccess,
}

impl AccessLevel {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(AccessLevel::Full),
            "observer" => Some(AccessLevel::Observer),
            "blocked" => Some(AccessLevel::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrafficStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A clonable sender used by any task to queue an outbound line for a peer.
/// The receiving end lives in the task that owns the actual `TcpStream`.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl OutboundHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a line for delivery. Silently drops the message if the writer
    /// task has already exited, mirroring the Python source swallowing
    /// `ConnectionResetError`/`BrokenPipeError` on a dead socket.
    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }
}

/// Fields common to both the upstream link and a client connection.
pub struct ConnectionState {
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub is_closing: bool,
    pub display_name: String,
    pub display_name_source: DisplayNameSource,
    pub simulator_name: String,
    pub router_name: String,
    pub uuid: Option<String>,
    pub is_frankenrouter: bool,
    pub stats: TrafficStats,

    pub frdp_ping_request_id: Option<String>,
    pub frdp_ping_sent: Option<Instant>,
    pub frdp_ping_rtts: VecDeque<Duration>,

    pub outbound: OutboundHandle,
}

impl ConnectionState {
    pub fn new(peer: SocketAddr, outbound: OutboundHandle, default_display_name: &str) -> Self {
        Self {
            peer,
            connected_at: Instant::now(),
            is_closing: false,
            display_name: default_display_name.to_string(),
            display_name_source: DisplayNameSource::Unknown,
            simulator_name: "unknown sim".to_string(),
            router_name: "unknown router".to_string(),
            uuid: None,
            is_frankenrouter: false,
            stats: TrafficStats::default(),
            frdp_ping_request_id: None,
            frdp_ping_sent: None,
            frdp_ping_rtts: VecDeque::with_capacity(32),
            outbound,
        }
    }

    pub fn record_sent(&mut self, line: &str) {
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += line.len() as u64 + 1;
    }

    pub fn record_received(&mut self, line: &str) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += line.len() as u64 + 1;
    }
}

/// A downstream client connection.
pub struct ClientConnection {
    pub base: ConnectionState,
    pub client_id: u64,
    pub access_level: AccessLevel,
    pub nolong: bool,
    pub welcome_sent: bool,
    pub welcome_keywords_sent: HashSet<String>,
    pub waiting_for_start_keywords: bool,
    pub demands: HashSet<String>,
    pub client_provided_id: Option<String>,
    pub client_provided_display_name: Option<String>,
    pub frdp_ident_sent: bool,
}

impl ClientConnection {
    pub fn new(peer: SocketAddr, client_id: u64, outbound: OutboundHandle) -> Self {
        Self {
            base: ConnectionState::new(peer, outbound, "unknown client"),
            client_id,
            access_level: AccessLevel::NoAccess,
            nolong: false,
            welcome_sent: false,
            welcome_keywords_sent: HashSet::new(),
            waiting_for_start_keywords: false,
            demands: HashSet::new(),
            client_provided_id: None,
            client_provided_display_name: None,
            frdp_ident_sent: false,
        }
    }

    pub fn has_access(&self) -> bool {
        self.access_level != AccessLevel::NoAccess
    }

    pub fn can_write(&self) -> bool {
        self.access_level == AccessLevel::Full
    }

    /// Determine the access level for this client against the configured
    /// `[[access]]` rules, in order: password+IP match, IP-only match,
    /// password-only match, then combined match. The first matching rule
    /// wins; no match leaves the client at `NoAccess`.
    pub fn update_access_level(&mut self, rules: &[AccessRule], client_password: Option<&str>) {
        let client_ip = self.base.peer.ip();
        for rule in rules {
            let valid_password = rule
                .match_password
                .as_deref()
                .is_some_and(|expected| Some(expected) == client_password);
            let valid_ip = rule
                .match_ipv4
                .iter()
                .any(|net| net.contains(&client_ip));

            let matches = match (&rule.match_ipv4.is_empty(), &rule.match_password) {
                (false, None) => valid_ip,
                (true, Some(_)) => valid_password,
                _ => valid_password && valid_ip,
            };

            if matches {
                self.access_level =
                    AccessLevel::from_config_str(&rule.level).unwrap_or(AccessLevel::NoAccess);
                self.base.display_name = rule.display_name.clone();
                self.base.display_name_source = DisplayNameSource::AccessConfig;
                return;
            }
        }
        self.access_level = AccessLevel::NoAccess;
        self.base.display_name = "auth pending".to_string();
    }
}

/// The single upstream link (to PSX main server or another router).
pub struct UpstreamConnection {
    pub base: ConnectionState,
    pub frdp_ident_sent: bool,
    pub frdp_auth_sent: bool,
}

impl UpstreamConnection {
    pub fn new(peer: SocketAddr, outbound: OutboundHandle) -> Self {
        Self {
            base: ConnectionState::new(peer, outbound, "unknown connection"),
            frdp_ident_sent: false,
            frdp_auth_sent: false,
        }
    }
}
