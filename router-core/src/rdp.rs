//! # RDP Scheduler
//!
//! Drives the inter-router sub-protocol's periodic side: a `PING` every
//! tick on each router-peer link (upstream and any client that identified
//! itself as another router), a one-time `IDENT` the first tick after a
//! peer is recognized, a one-time `AUTH` to upstream when we're configured
//! with a password and upstream turned out to be a router too, and a
//! `SHAREDINFO` re-emit to every router peer when the Rule Engine marked
//! one pending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;

use crate::connection::ConnectionState;
use crate::context::RouterContext;

const RDP_PERIOD: Duration = Duration::from_secs(5);

pub async fn run(ctx: Arc<RouterContext>) {
    loop {
        sleep(RDP_PERIOD).await;
        tick(&ctx).await;
    }
}

async fn tick(ctx: &Arc<RouterContext>) {
    if let Some(link) = ctx.upstream.read().await.as_ref() {
        let mut conn = link.connection.lock().await;
        if conn.base.is_frankenrouter {
            send_ping(&mut conn.base);
            if !conn.frdp_ident_sent {
                send_ident(ctx, &mut conn.base);
                conn.frdp_ident_sent = true;
            }
            if !conn.frdp_auth_sent {
                if let Some(password) = &ctx.config.upstream.password {
                    conn.base
                        .outbound
                        .send_line(format!("addon=FRANKENROUTER:{}:AUTH:{password}", crate::rules::FRDP_VERSION));
                    conn.frdp_auth_sent = true;
                }
            }
        }
    }

    let mut clients = ctx.clients.write().await;
    for client in clients.values_mut() {
        if client.base.is_frankenrouter {
            send_ping(&mut client.base);
            if !client.frdp_ident_sent {
                send_ident(ctx, &mut client.base);
                client.frdp_ident_sent = true;
            }
        }
    }
    drop(clients);

    send_sharedinfo_if_pending(ctx).await;
}

/// Disseminates `pilot_flying_simulator` to router peers after a
/// FLIGHTCONTROLS-family verb marked it dirty, mirroring the shape of a
/// received SHAREDINFO payload so peers parse it the same way either side.
async fn send_sharedinfo_if_pending(ctx: &Arc<RouterContext>) {
    let mut sharedinfo = ctx.sharedinfo.lock().await;
    if !std::mem::take(&mut sharedinfo.sharedinfo_reemit_pending) {
        return;
    }
    let master_uuid = sharedinfo.master_uuid.clone().unwrap_or_else(|| ctx.own_uuid.clone());
    let pilot_flying_simulator = sharedinfo.pilot_flying_simulator.clone();
    drop(sharedinfo);

    let payload = serde_json::json!({
        "master_uuid": master_uuid,
        "pilot_flying_simulator": pilot_flying_simulator,
    });
    let line = format!("addon=FRANKENROUTER:{}:SHAREDINFO:{payload}", crate::rules::FRDP_VERSION);

    if let Some(link) = ctx.upstream.read().await.as_ref() {
        let conn = link.connection.lock().await;
        if conn.base.is_frankenrouter {
            conn.base.outbound.send_line(line.clone());
        }
    }
    for client in ctx.clients.read().await.values() {
        if client.base.is_frankenrouter {
            client.base.outbound.send_line(line.clone());
        }
    }
}

fn send_ping(conn: &mut ConnectionState) {
    let request_id: u32 = rand::thread_rng().gen();
    let request_id = request_id.to_string();
    conn.outbound
        .send_line(format!("addon=FRANKENROUTER:{}:PING:{request_id}", crate::rules::FRDP_VERSION));
    conn.frdp_ping_request_id = Some(request_id);
    conn.frdp_ping_sent = Some(Instant::now());
}

fn send_ident(ctx: &RouterContext, conn: &mut ConnectionState) {
    conn.outbound.send_line(format!(
        "addon=FRANKENROUTER:{}:IDENT:{}:{}:{}",
        crate::rules::FRDP_VERSION,
        ctx.config.identity.simulator,
        ctx.config.identity.router,
        ctx.own_uuid,
    ));
}
