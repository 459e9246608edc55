//! # Rule Engine
//!
//! Pure decision logic for a single received protocol line: what happens to
//! it (forward as-is, forward only upstream, forward filtered to a subset
//! of peers, drop, or disconnect the sender) and why. Kept free of I/O and
//! task state so the whole dispatch table can run as plain synchronous code
//! under test.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::cache::Cache;
use crate::catalog::Catalog;
use crate::config::RouterConfig;
use crate::connection::{ClientConnection, DisplayNameSource, UpstreamConnection};
use crate::context::SharedInfo;
use crate::message::Message;

/// FRDP addon-protocol version this build speaks. A sender on a different
/// version is disconnected rather than guessed at.
pub const FRDP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressFilter {
    NoLong,
    Start { key: String },
    ExcludeNonFrankenrouter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulesAction {
    Drop,
    Disconnect,
    Normal,
    /// Forward only to upstream; never broadcast to other clients.
    UpstreamOnly,
    Filter(EgressFilter),
    /// Send this line back to the sender instead of forwarding anything.
    Reply(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesCode {
    MessageInvalid,
    NonPsx,
    KeyValueNormal,
    KeyValueFilteredIngress,
    KeyValueFilteredIngressSilent,
    KeyValueFilteredEgressNolong,
    KeyValueFilteredEgressStart,
    NameLearned,
    NameNoChange,
    NameRejected,
    Demand,
    Again,
    Start,
    Pbskaq,
    Layout,
    Load,
    Bang,
    Exit,
    NoLong,
    NoWrite,
    AddonUnhandled,
    FrdpVersionMismatch,
    FrdpPing,
    FrdpPong,
    FrdpIdent,
    FrdpMyControls,
    FrdpAllControlLocks,
    FrdpNoControlLocks,
    FrdpFlightControls,
    FrdpJoin,
    FrdpClientInfo,
    FrdpRouterInfo,
    FrdpSharedInfo,
    FrdpAuthOk,
    FrdpAuthFail,
    FrdpAuthAlreadyHasAccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub action: RulesAction,
    pub code: RulesCode,
    pub message: Option<String>,
}

fn myreturn(action: RulesAction, code: RulesCode, message: Option<String>) -> RuleOutcome {
    RuleOutcome { action, code, message }
}

/// Wraps the two connection kinds so the rule engine can treat "sender" as
/// one value without a trait object per call site.
pub enum Sender<'a> {
    Client(&'a mut ClientConnection),
    Upstream(&'a mut UpstreamConnection),
}

impl<'a> Sender<'a> {
    pub fn is_upstream(&self) -> bool {
        matches!(self, Sender::Upstream(_))
    }

    pub fn is_frankenrouter(&self) -> bool {
        match self {
            Sender::Client(c) => c.base.is_frankenrouter,
            Sender::Upstream(u) => u.base.is_frankenrouter,
        }
    }

    pub fn set_is_frankenrouter(&mut self, v: bool) {
        match self {
            Sender::Client(c) => c.base.is_frankenrouter = v,
            Sender::Upstream(u) => u.base.is_frankenrouter = v,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Sender::Client(c) => &c.base.display_name,
            Sender::Upstream(u) => &u.base.display_name,
        }
    }

    pub fn set_display_name(&mut self, name: String, source: DisplayNameSource) {
        match self {
            Sender::Client(c) => {
                c.base.display_name = name;
                c.base.display_name_source = source;
            }
            Sender::Upstream(u) => {
                u.base.display_name = name;
                u.base.display_name_source = source;
            }
        }
    }

    pub fn simulator_name(&self) -> &str {
        match self {
            Sender::Client(c) => &c.base.simulator_name,
            Sender::Upstream(u) => &u.base.simulator_name,
        }
    }

    pub fn set_simulator_name(&mut self, name: String) {
        match self {
            Sender::Client(c) => c.base.simulator_name = name,
            Sender::Upstream(u) => u.base.simulator_name = name,
        }
    }

    pub fn set_router_name(&mut self, name: String) {
        match self {
            Sender::Client(c) => c.base.router_name = name,
            Sender::Upstream(u) => u.base.router_name = name,
        }
    }

    pub fn set_uuid(&mut self, uuid: String) {
        match self {
            Sender::Client(c) => c.base.uuid = Some(uuid),
            Sender::Upstream(u) => u.base.uuid = Some(uuid),
        }
    }

    pub fn connected_at(&self) -> Instant {
        match self {
            Sender::Client(c) => c.base.connected_at,
            Sender::Upstream(u) => u.base.connected_at,
        }
    }

    pub fn peer(&self) -> std::net::SocketAddr {
        match self {
            Sender::Client(c) => c.base.peer,
            Sender::Upstream(u) => u.base.peer,
        }
    }

    /// Upstream can always write; a client needs `full` access.
    pub fn allow_write(&self) -> bool {
        match self {
            Sender::Upstream(_) => true,
            Sender::Client(c) => c.can_write(),
        }
    }

    pub fn has_access(&self) -> bool {
        match self {
            Sender::Upstream(_) => true,
            Sender::Client(c) => c.has_access(),
        }
    }

    pub fn update_access_level(
        &mut self,
        rules: &[crate::config::AccessRule],
        password: Option<&str>,
    ) {
        if let Sender::Client(c) = self {
            c.update_access_level(rules, password);
        }
    }

    pub fn nolong(&self) -> bool {
        match self {
            Sender::Client(c) => c.nolong,
            Sender::Upstream(_) => false,
        }
    }

    pub fn set_nolong(&mut self, v: bool) {
        if let Sender::Client(c) = self {
            c.nolong = v;
        }
    }

    pub fn add_demand(&mut self, key: String) {
        if let Sender::Client(c) = self {
            c.demands.insert(key);
        }
    }

    pub fn client_provided_id(&self) -> Option<&str> {
        match self {
            Sender::Client(c) => c.client_provided_id.as_deref(),
            Sender::Upstream(_) => None,
        }
    }

    pub fn set_client_provided_id(&mut self, v: Option<String>) {
        if let Sender::Client(c) = self {
            c.client_provided_id = v;
        }
    }

    pub fn client_provided_display_name(&self) -> Option<&str> {
        match self {
            Sender::Client(c) => c.client_provided_display_name.as_deref(),
            Sender::Upstream(_) => None,
        }
    }

    pub fn set_client_provided_display_name(&mut self, v: Option<String>) {
        if let Sender::Client(c) = self {
            c.client_provided_display_name = v;
        }
    }

    pub fn frdp_ping_request_id(&self) -> Option<&str> {
        match self {
            Sender::Client(c) => c.base.frdp_ping_request_id.as_deref(),
            Sender::Upstream(u) => u.base.frdp_ping_request_id.as_deref(),
        }
    }

    pub fn frdp_ping_sent(&self) -> Option<Instant> {
        match self {
            Sender::Client(c) => c.base.frdp_ping_sent,
            Sender::Upstream(u) => u.base.frdp_ping_sent,
        }
    }

    pub fn push_frdp_ping_rtt(&mut self, d: Duration) {
        const MAX_TRACKED_RTTS: usize = 300;
        let rtts = match self {
            Sender::Client(c) => &mut c.base.frdp_ping_rtts,
            Sender::Upstream(u) => &mut u.base.frdp_ping_rtts,
        };
        if rtts.len() >= MAX_TRACKED_RTTS {
            rtts.pop_front();
        }
        rtts.push_back(d);
    }
}

/// Everything the rule engine needs to read or mutate while routing one
/// line, borrowed from the owning `RouterContext` for the call's duration.
pub struct RuleContext<'a> {
    pub catalog: &'a Catalog,
    pub cache: &'a mut Cache,
    pub config: &'a RouterConfig,
    pub sharedinfo: &'a mut SharedInfo,
    pub clients: &'a mut HashMap<u64, ClientConnection>,
    pub own_uuid: &'a str,
    pub last_load1: &'a mut Option<Instant>,
    pub last_load3: &'a mut Option<Instant>,
}

fn bacars_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i).*(BACARS|BA ACARS).*").unwrap())
}

fn vpilot_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i).*vPilot.*").unwrap())
}

/// Matches a `name=` value that self-identifies as another router instance,
/// generalized from the original vendor-specific `FRANKEN.PY frankenrouter`
/// string to this router's own configurable implementation tag.
fn router_peer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*:psx-router router$").unwrap())
}

fn handle_name(sender: &mut Sender, value: &str) -> RuleOutcome {
    if value.is_empty() {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }
    if sender.is_frankenrouter() {
        return myreturn(RulesAction::Drop, RulesCode::NameRejected, None);
    }
    if router_peer_pattern().is_match(value) {
        let display = value.split(':').next().unwrap_or(value).to_string();
        sender.set_display_name(display, DisplayNameSource::NameMessage);
        sender.set_is_frankenrouter(true);
        return myreturn(RulesAction::Normal, RulesCode::NameLearned, None);
    }

    let (id, display) = match value.split_once(':') {
        Some((id, display)) => (Some(id.to_string()), display.to_string()),
        None => (None, value.to_string()),
    };
    let changed = sender.client_provided_id() != id.as_deref()
        || sender.client_provided_display_name() != Some(display.as_str());
    sender.set_client_provided_id(id);
    sender.set_client_provided_display_name(Some(display.clone()));
    sender.set_display_name(display, DisplayNameSource::NameMessage);

    if changed {
        myreturn(RulesAction::Normal, RulesCode::NameLearned, None)
    } else {
        myreturn(RulesAction::Normal, RulesCode::NameNoChange, None)
    }
}

fn handle_demand(sender: &mut Sender, key: &str) -> RuleOutcome {
    if sender.is_upstream() {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }
    sender.add_demand(key.to_string());
    myreturn(RulesAction::UpstreamOnly, RulesCode::Demand, None)
}

fn handle_sim_scoped(ctx: &RuleContext, sender: &Sender, code: RulesCode) -> RuleOutcome {
    if sender.is_frankenrouter() && ctx.config.identity.simulator != sender.simulator_name() {
        myreturn(RulesAction::Drop, code, None)
    } else {
        myreturn(RulesAction::Normal, code, None)
    }
}

fn handle_addon_frankenrouter_ping(sender: &mut Sender, payload: &str) -> RuleOutcome {
    sender.set_is_frankenrouter(true);
    let reply = format!("addon=FRANKENROUTER:{FRDP_VERSION}:PONG:{payload}");
    myreturn(RulesAction::Reply(reply), RulesCode::FrdpPing, None)
}

fn handle_addon_frankenrouter_pong(sender: &mut Sender, payload: &str) -> RuleOutcome {
    if sender.frdp_ping_request_id() != Some(payload) {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }
    if let Some(sent) = sender.frdp_ping_sent() {
        sender.push_frdp_ping_rtt(sent.elapsed());
    }
    myreturn(RulesAction::Drop, RulesCode::FrdpPong, None)
}

fn handle_addon_frankenrouter_ident(sender: &mut Sender, payload: &str) -> RuleOutcome {
    let mut parts = payload.splitn(3, ':');
    let (Some(sim), Some(router), Some(uuid)) = (parts.next(), parts.next(), parts.next()) else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };
    sender.set_simulator_name(sim.to_string());
    sender.set_router_name(router.to_string());
    sender.set_uuid(uuid.to_string());
    sender.set_display_name(router.to_string(), DisplayNameSource::FrdpIdent);
    sender.set_is_frankenrouter(true);
    myreturn(RulesAction::Drop, RulesCode::FrdpIdent, None)
}

/// Normalizes a pilot-flying identity to one of `{NO_CONTROL_LOCKS,
/// ALL_CONTROL_LOCKS, <sim-identity>}`, updates shared state, marks a
/// SHAREDINFO re-emit as pending for the RDP scheduler's next tick, and
/// returns the `Qs421` free-message line summarizing it for the EICAS-like
/// display.
fn apply_flightcontrols(ctx: &mut RuleContext, identity: &str) -> String {
    let (normalized, message) = match identity {
        "NO_CONTROL_LOCKS" => ("NO_CONTROL_LOCKS".to_string(), "Qs421=".to_string()),
        "ALL_CONTROL_LOCKS" => ("ALL_CONTROL_LOCKS".to_string(), "Qs421=PF: NOONE".to_string()),
        other => {
            let ident: String = other.chars().take(11).collect::<String>().to_uppercase();
            (other.to_string(), format!("Qs421=PF: {ident}"))
        }
    };
    ctx.sharedinfo.pilot_flying_simulator = Some(normalized);
    ctx.sharedinfo.sharedinfo_reemit_pending = true;
    message
}

fn handle_addon_frankenrouter_flightcontrols(
    ctx: &mut RuleContext,
    payload: &str,
) -> RuleOutcome {
    let message = apply_flightcontrols(ctx, payload);
    myreturn(RulesAction::Drop, RulesCode::FrdpFlightControls, Some(message))
}

#[derive(serde::Deserialize)]
struct ClientInfoPayload {
    laddr: String,
    lport: u16,
    name: String,
}

fn handle_addon_frankenrouter_clientinfo(
    ctx: &mut RuleContext,
    sender: &Sender,
    payload: &str,
) -> RuleOutcome {
    if sender.is_upstream() {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }
    let Ok(info) = serde_json::from_str::<ClientInfoPayload>(payload) else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };
    let Ok(ip) = info.laddr.parse::<IpAddr>() else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };
    let target = std::net::SocketAddr::new(ip, info.lport);
    if let Some(client) = ctx.clients.values_mut().find(|c| c.base.peer == target) {
        client.base.display_name = info.name;
        client.base.display_name_source = DisplayNameSource::FrdpClientInfo;
    }
    myreturn(RulesAction::Drop, RulesCode::FrdpClientInfo, None)
}

#[derive(serde::Deserialize)]
struct RouterInfoPayload {
    uuid: String,
}

fn handle_addon_frankenrouter_routerinfo(ctx: &mut RuleContext, payload: &str) -> RuleOutcome {
    let Ok(info) = serde_json::from_str::<RouterInfoPayload>(payload) else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };
    ctx.sharedinfo.peer_uuid = Some(info.uuid);
    ctx.sharedinfo.peer_routerinfo_received_at = Some(Instant::now());
    myreturn(
        RulesAction::Filter(EgressFilter::ExcludeNonFrankenrouter),
        RulesCode::FrdpRouterInfo,
        None,
    )
}

#[derive(serde::Deserialize)]
struct SharedInfoPayload {
    master_uuid: String,
    pilot_flying_simulator: Option<String>,
}

fn handle_addon_frankenrouter_sharedinfo(ctx: &mut RuleContext, payload: &str) -> RuleOutcome {
    let Ok(info) = serde_json::from_str::<SharedInfoPayload>(payload) else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };
    if info.master_uuid != ctx.own_uuid && info.master_uuid < *ctx.own_uuid {
        ctx.sharedinfo.master_uuid = Some(info.master_uuid);
    }
    if let Some(pfs) = info.pilot_flying_simulator {
        ctx.sharedinfo.pilot_flying_simulator = Some(pfs);
    }
    myreturn(
        RulesAction::Filter(EgressFilter::ExcludeNonFrankenrouter),
        RulesCode::FrdpSharedInfo,
        None,
    )
}

fn handle_addon_frankenrouter_auth(
    ctx: &RuleContext,
    sender: &mut Sender,
    payload: &str,
) -> RuleOutcome {
    if sender.is_upstream() {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }
    if sender.has_access() {
        return myreturn(RulesAction::Drop, RulesCode::FrdpAuthAlreadyHasAccess, None);
    }
    if payload.is_empty() {
        return myreturn(RulesAction::Disconnect, RulesCode::FrdpAuthFail, None);
    }
    sender.update_access_level(&ctx.config.access, Some(payload));
    if sender.has_access() {
        myreturn(RulesAction::Drop, RulesCode::FrdpAuthOk, None)
    } else {
        myreturn(RulesAction::Disconnect, RulesCode::FrdpAuthFail, None)
    }
}

fn handle_addon_frankenrouter(ctx: &mut RuleContext, sender: &mut Sender, payload: &str) -> RuleOutcome {
    let (version_str, rest) = payload.split_once(':').unwrap_or((payload, ""));
    let version: u32 = version_str.parse().unwrap_or(0);
    if version != FRDP_VERSION {
        return myreturn(RulesAction::Disconnect, RulesCode::FrdpVersionMismatch, None);
    }
    let (message_type, mpayload) = rest.split_once(':').unwrap_or((rest, ""));
    match message_type {
        "PING" => handle_addon_frankenrouter_ping(sender, mpayload),
        "PONG" => handle_addon_frankenrouter_pong(sender, mpayload),
        "IDENT" => handle_addon_frankenrouter_ident(sender, mpayload),
        "MY_CONTROLS" => {
            let own_identity = ctx.config.identity.simulator.clone();
            let message = apply_flightcontrols(ctx, &own_identity);
            myreturn(RulesAction::Drop, RulesCode::FrdpMyControls, Some(message))
        }
        "ALL_CONTROL_LOCKS" => {
            let message = apply_flightcontrols(ctx, "ALL_CONTROL_LOCKS");
            myreturn(RulesAction::Drop, RulesCode::FrdpAllControlLocks, Some(message))
        }
        "NO_CONTROL_LOCKS" => {
            let message = apply_flightcontrols(ctx, "NO_CONTROL_LOCKS");
            myreturn(RulesAction::Drop, RulesCode::FrdpNoControlLocks, Some(message))
        }
        "FLIGHTCONTROLS" => handle_addon_frankenrouter_flightcontrols(ctx, mpayload),
        "JOIN" => myreturn(RulesAction::Normal, RulesCode::FrdpJoin, None),
        "CLIENTINFO" => handle_addon_frankenrouter_clientinfo(ctx, sender, mpayload),
        "ROUTERINFO" => handle_addon_frankenrouter_routerinfo(ctx, mpayload),
        "SHAREDINFO" => handle_addon_frankenrouter_sharedinfo(ctx, mpayload),
        "AUTH" => handle_addon_frankenrouter_auth(ctx, sender, mpayload),
        _ => myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None),
    }
}

fn handle_addon(ctx: &mut RuleContext, sender: &mut Sender, rest: &str) -> RuleOutcome {
    let (addon, payload) = rest.split_once(':').unwrap_or((rest, ""));
    if addon == "FRANKENROUTER" {
        return handle_addon_frankenrouter(ctx, sender, payload);
    }
    if sender.allow_write() {
        myreturn(RulesAction::Normal, RulesCode::AddonUnhandled, None)
    } else {
        myreturn(RulesAction::Drop, RulesCode::NoWrite, None)
    }
}

/// Route one received protocol line from `sender` and decide what happens
/// to it. Mirrors the original dispatch order closely: self-identification
/// and addon verbs bypass the write gate (an unauthenticated client still
/// needs to reach FRDP `auth`), everything else needs `full` access first.
pub fn route(ctx: &mut RuleContext, line: &str, sender: &mut Sender) -> RuleOutcome {
    let Some(message) = Message::parse(line) else {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    };

    match &message {
        Message::Name(value) | Message::ClientName(value) => return handle_name(sender, value),
        Message::Addon(rest) => return handle_addon(ctx, sender, rest),
        Message::Demand(key) => return handle_demand(sender, key),
        _ => {}
    }

    if !sender.allow_write() {
        return myreturn(RulesAction::Drop, RulesCode::NoWrite, None);
    }

    match message {
        Message::Again => {
            if sender.is_upstream() {
                return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
            }
            return myreturn(RulesAction::UpstreamOnly, RulesCode::Again, None);
        }
        Message::Start => {
            if sender.is_upstream() {
                return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
            }
            return myreturn(RulesAction::UpstreamOnly, RulesCode::Start, None);
        }
        Message::PleaseBeSoKindAndQuit => {
            return myreturn(RulesAction::Disconnect, RulesCode::Pbskaq, None)
        }
        Message::Layout => return handle_sim_scoped(ctx, sender, RulesCode::Layout),
        Message::Load1 => {
            *ctx.last_load1 = Some(Instant::now());
            return myreturn(RulesAction::Normal, RulesCode::Load, None);
        }
        Message::Load2 => return myreturn(RulesAction::Normal, RulesCode::Load, None),
        Message::Load3 => {
            *ctx.last_load3 = Some(Instant::now());
            return myreturn(RulesAction::Normal, RulesCode::Load, None);
        }
        Message::Bang => return myreturn(RulesAction::Drop, RulesCode::Bang, None),
        Message::Exit => return myreturn(RulesAction::Drop, RulesCode::Exit, None),
        Message::NoLong => {
            if sender.is_upstream() {
                return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
            }
            sender.set_nolong(!sender.nolong());
            return myreturn(RulesAction::Drop, RulesCode::NoLong, None);
        }
        _ => {}
    }

    let Message::KeyValue { key, value } = message else {
        unreachable!("every other variant returned above");
    };

    if !ctx.catalog.is_psx_keyword(&key) {
        tracing::warn!(keyword = %key, "received non-PSX keyword");
        return myreturn(RulesAction::Normal, RulesCode::NonPsx, None);
    }

    if key == "Qh426" && ctx.config.filtering.tiller {
        if let (Ok(new_val), Ok(current)) = (value.parse::<i64>(), ctx.cache.get_value(&key)) {
            if let Ok(current_val) = current.as_str().parse::<i64>() {
                let movement = (current_val - new_val).abs();
                if movement < ctx.config.filtering.tiller_smallest_movement
                    && new_val.abs() > ctx.config.filtering.tiller_center
                {
                    return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngress, None);
                }
            }
        }
    }

    if ctx.config.psx.filter_flight_controls
        && !sender.is_upstream()
        && matches!(key.as_str(), "Qs120" | "Qs357" | "Qs436" | "Qh388" | "Qh426")
    {
        match ctx.sharedinfo.pilot_flying_simulator.as_deref() {
            Some("NO_CONTROL_LOCKS") | None => {}
            Some("ALL_CONTROL_LOCKS") => {
                return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngress, None);
            }
            Some(flying_sim) => {
                if flying_sim != ctx.config.identity.simulator {
                    return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngress, None);
                }
            }
        }
    }

    if !sender.is_upstream() && key == "Qs119" {
        let within_grace = sender.connected_at().elapsed() < Duration::from_secs(30);
        if within_grace && bacars_pattern().is_match(sender.display_name()) {
            return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngress, None);
        }
    }

    if !sender.is_upstream() && key == "Qi198" && ctx.config.psx.filter_elevation {
        return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngressSilent, None);
    }

    if !sender.is_upstream()
        && matches!(key.as_str(), "Qs450" | "Qs451")
        && ctx.config.psx.filter_traffic
        && vpilot_pattern().is_match(sender.display_name())
    {
        return myreturn(RulesAction::Drop, RulesCode::KeyValueFilteredIngressSilent, None);
    }

    if ctx.cache.update(&key, &value).is_err() {
        return myreturn(RulesAction::Drop, RulesCode::MessageInvalid, None);
    }

    if let Some(def) = ctx.catalog.get(&key) {
        if def.additional_modes.contains(&"NOLONG") {
            return myreturn(
                RulesAction::Filter(EgressFilter::NoLong),
                RulesCode::KeyValueFilteredEgressNolong,
                None,
            );
        }
        let is_econ = def.mode == "ECON" || def.additional_modes.contains(&"ECON");
        if def.mode == "START" && !is_econ {
            let stale = ctx
                .last_load3
                .map(|t| t.elapsed() > Duration::from_secs(5))
                .unwrap_or(true);
            if stale {
                return myreturn(
                    RulesAction::Filter(EgressFilter::Start { key: key.clone() }),
                    RulesCode::KeyValueFilteredEgressStart,
                    None,
                );
            }
        }
    }

    myreturn(RulesAction::Normal, RulesCode::KeyValueNormal, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::connection::OutboundHandle;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn base_config() -> RouterConfig {
        RouterConfig::from_str("[log]\ndirectory = '.'\n").unwrap()
    }

    fn catalog() -> Catalog {
        Catalog::parse("Qs119=\"X\"; Mode=ECON; Min=0; Max=1;\nQi198=\"Y\"; Mode=ECON; Min=0; Max=1;\n")
            .unwrap()
    }

    struct Harness {
        config: RouterConfig,
        catalog: Catalog,
        cache: Cache,
        sharedinfo: SharedInfo,
        clients: HashMap<u64, ClientConnection>,
        own_uuid: String,
        last_load1: Option<Instant>,
        last_load3: Option<Instant>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: base_config(),
                catalog: catalog(),
                cache: Cache::new(),
                sharedinfo: SharedInfo::default(),
                clients: HashMap::new(),
                own_uuid: "aaaa".to_string(),
                last_load1: None,
                last_load3: None,
            }
        }

        fn ctx(&mut self) -> RuleContext<'_> {
            RuleContext {
                catalog: &self.catalog,
                cache: &mut self.cache,
                config: &self.config,
                sharedinfo: &mut self.sharedinfo,
                clients: &mut self.clients,
                own_uuid: &self.own_uuid,
                last_load1: &mut self.last_load1,
                last_load3: &mut self.last_load3,
            }
        }
    }

    fn full_client() -> ClientConnection {
        let (handle, _rx) = OutboundHandle::new();
        let mut client = ClientConnection::new(addr(), 1, handle);
        client.access_level = crate::connection::AccessLevel::Full;
        client
    }

    fn upstream() -> UpstreamConnection {
        let (handle, _rx) = OutboundHandle::new();
        UpstreamConnection::new(addr(), handle)
    }

    #[test]
    fn test_invalid_message() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "", &mut sender);
        assert_eq!(outcome.action, RulesAction::Drop);
        assert_eq!(outcome.code, RulesCode::MessageInvalid);
    }

    #[test]
    fn test_name_learns_display_name() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "name=id123:Captain Bob", &mut sender);
        assert_eq!(outcome.code, RulesCode::NameLearned);
        assert_eq!(client.base.display_name, "Captain Bob");
    }

    #[test]
    fn test_name_detects_router_peer() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "name=otherrouter:psx-router router", &mut sender);
        assert_eq!(outcome.code, RulesCode::NameLearned);
        assert!(client.base.is_frankenrouter);
    }

    #[test]
    fn test_demand_requires_access_but_not_write_gate() {
        let mut h = Harness::new();
        let (handle, _rx) = OutboundHandle::new();
        let mut client = ClientConnection::new(addr(), 1, handle);
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "demand=Qs119", &mut sender);
        assert_eq!(outcome.code, RulesCode::Demand);
        assert!(client.demands.contains("Qs119"));
    }

    #[test]
    fn test_nowrite_blocks_plain_keyword() {
        let mut h = Harness::new();
        let (handle, _rx) = OutboundHandle::new();
        let mut client = ClientConnection::new(addr(), 1, handle);
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qs119=1", &mut sender);
        assert_eq!(outcome.code, RulesCode::NoWrite);
    }

    #[test]
    fn test_again_start_exit() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let again = route(&mut h.ctx(), "again", &mut sender);
        assert_eq!(again.code, RulesCode::Again);
        assert_eq!(again.action, RulesAction::UpstreamOnly);
        let start = route(&mut h.ctx(), "start", &mut sender);
        assert_eq!(start.code, RulesCode::Start);
        assert_eq!(start.action, RulesAction::UpstreamOnly);
        assert_eq!(route(&mut h.ctx(), "exit", &mut sender).code, RulesCode::Exit);
    }

    #[test]
    fn test_again_start_rejected_from_upstream() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        assert_eq!(route(&mut h.ctx(), "again", &mut sender).code, RulesCode::MessageInvalid);
        assert_eq!(route(&mut h.ctx(), "start", &mut sender).code, RulesCode::MessageInvalid);
    }

    #[test]
    fn test_demand_is_upstream_only() {
        let mut h = Harness::new();
        let (handle, _rx) = OutboundHandle::new();
        let mut client = ClientConnection::new(addr(), 1, handle);
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "demand=Qs119", &mut sender);
        assert_eq!(outcome.action, RulesAction::UpstreamOnly);
    }

    #[test]
    fn test_nolong_toggles_client_flag() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        route(&mut h.ctx(), "nolong", &mut sender);
        assert!(client.nolong);
        let mut sender = Sender::Client(&mut client);
        route(&mut h.ctx(), "nolong", &mut sender);
        assert!(!client.nolong);
    }

    #[test]
    fn test_nolong_from_upstream_is_invalid() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        let outcome = route(&mut h.ctx(), "nolong", &mut sender);
        assert_eq!(outcome.code, RulesCode::MessageInvalid);
    }

    #[test]
    fn test_frdp_upstream_ping_replies_without_forwarding() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:PING:req42", &mut sender);
        assert_eq!(outcome.code, RulesCode::FrdpPing);
        assert_eq!(
            outcome.action,
            RulesAction::Reply("addon=FRANKENROUTER:1:PONG:req42".to_string())
        );
        assert!(up.base.is_frankenrouter);
    }

    #[test]
    fn test_frdp_version_mismatch_disconnects() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:99:PING:x", &mut sender);
        assert_eq!(outcome.action, RulesAction::Disconnect);
        assert_eq!(outcome.code, RulesCode::FrdpVersionMismatch);
    }

    #[test]
    fn test_frdp_client_auth_rejects_empty_password() {
        let mut h = Harness::new();
        let (handle, _rx) = OutboundHandle::new();
        let mut client = ClientConnection::new(addr(), 1, handle);
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:AUTH:", &mut sender);
        assert_eq!(outcome.code, RulesCode::FrdpAuthFail);
    }

    #[test]
    fn test_frdp_client_auth_already_has_access() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:AUTH:whatever", &mut sender);
        assert_eq!(outcome.code, RulesCode::FrdpAuthAlreadyHasAccess);
    }

    #[test]
    fn test_ingress_elevation_filter_silent() {
        let mut h = Harness::new();
        h.config.psx.filter_elevation = true;
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qi198=5", &mut sender);
        assert_eq!(outcome.code, RulesCode::KeyValueFilteredIngressSilent);
    }

    #[test]
    fn test_egress_filter_nolong() {
        let mut h = Harness::new();
        h.catalog = Catalog::parse("Qs375=\"X\"; Mode=ECON; Min=0; Max=1;\n").unwrap();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qs375=1", &mut sender);
        assert_eq!(
            outcome.action,
            RulesAction::Filter(EgressFilter::NoLong)
        );
        assert_eq!(outcome.code, RulesCode::KeyValueFilteredEgressNolong);
    }

    #[test]
    fn test_route_normal_keyvalue() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qs119=7", &mut sender);
        assert_eq!(outcome.action, RulesAction::Normal);
        assert_eq!(outcome.code, RulesCode::KeyValueNormal);
    }

    #[test]
    fn test_nonpsx_keyword_still_forwarded() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Gurka=1", &mut sender);
        assert_eq!(outcome.action, RulesAction::Normal);
        assert_eq!(outcome.code, RulesCode::NonPsx);
    }

    #[test]
    fn test_tiller_filter_drops_small_movement_near_stops() {
        let mut h = Harness::new();
        h.config.filtering.tiller = true;
        h.catalog = Catalog::parse("Qh426=\"X\"; Mode=ECON; Min=0; Max=1;\n").unwrap();
        h.cache.update("Qh426", "900").unwrap();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qh426=901", &mut sender);
        assert_eq!(outcome.action, RulesAction::Drop);
        assert_eq!(outcome.code, RulesCode::KeyValueFilteredIngress);
    }

    #[test]
    fn test_tiller_filter_allows_large_movement_near_stops() {
        let mut h = Harness::new();
        h.config.filtering.tiller = true;
        h.catalog = Catalog::parse("Qh426=\"X\"; Mode=ECON; Min=0; Max=1;\n").unwrap();
        h.cache.update("Qh426", "900").unwrap();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "Qh426=100", &mut sender);
        assert_eq!(outcome.action, RulesAction::Normal);
        assert_eq!(outcome.code, RulesCode::KeyValueNormal);
    }

    #[test]
    fn test_flightcontrols_normalizes_identity_and_emits_qs421() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:FLIGHTCONTROLS:OtherSimulator", &mut sender);
        assert_eq!(outcome.action, RulesAction::Drop);
        assert_eq!(outcome.code, RulesCode::FrdpFlightControls);
        assert_eq!(outcome.message.as_deref(), Some("Qs421=PF: OTHERSIMULA"));
        assert_eq!(h.sharedinfo.pilot_flying_simulator.as_deref(), Some("OtherSimulator"));
        assert!(h.sharedinfo.sharedinfo_reemit_pending);
    }

    #[test]
    fn test_flightcontrols_all_control_locks_message() {
        let mut h = Harness::new();
        let mut up = upstream();
        let mut sender = Sender::Upstream(&mut up);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:FLIGHTCONTROLS:ALL_CONTROL_LOCKS", &mut sender);
        assert_eq!(outcome.message.as_deref(), Some("Qs421=PF: NOONE"));
        assert_eq!(h.sharedinfo.pilot_flying_simulator.as_deref(), Some("ALL_CONTROL_LOCKS"));
    }

    #[test]
    fn test_my_controls_claims_own_identity() {
        let mut h = Harness::new();
        h.config.identity.simulator = "MySim".to_string();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:MY_CONTROLS", &mut sender);
        assert_eq!(outcome.action, RulesAction::Drop);
        assert_eq!(outcome.code, RulesCode::FrdpMyControls);
        assert_eq!(outcome.message.as_deref(), Some("Qs421=PF: MYSIM"));
        assert_eq!(h.sharedinfo.pilot_flying_simulator.as_deref(), Some("MySim"));
    }

    #[test]
    fn test_no_control_locks_clears_pilot_flying() {
        let mut h = Harness::new();
        let mut client = full_client();
        let mut sender = Sender::Client(&mut client);
        let outcome = route(&mut h.ctx(), "addon=FRANKENROUTER:1:NO_CONTROL_LOCKS", &mut sender);
        assert_eq!(outcome.message.as_deref(), Some("Qs421="));
        assert_eq!(h.sharedinfo.pilot_flying_simulator.as_deref(), Some("NO_CONTROL_LOCKS"));
    }
}
