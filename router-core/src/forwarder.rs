//! # Forwarders
//!
//! Two tasks, one per direction, each draining its own queue: pop a line,
//! run it through the Rule Engine against the sender's connection state,
//! then execute whatever `RulesAction` comes back. Kept as two separate
//! loops rather than one merged queue so a slow client never delays
//! upstream traffic reaching the other clients, and vice versa.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::context::RouterContext;
use crate::listener::ClientLine;
use crate::rules::{self, EgressFilter, RuleContext, RulesAction, Sender};
use crate::upstream::InboundLine;

pub async fn run_from_upstream(ctx: Arc<RouterContext>, mut rx: mpsc::UnboundedReceiver<InboundLine>) {
    while let Some(item) = rx.recv().await {
        let queue_time = item.received_at.elapsed();
        let handle_start = Instant::now();
        handle_from_upstream(&ctx, &item.line).await;
        warn_on_slow_handling(&ctx, "upstream", queue_time, handle_start.elapsed());
    }
}

pub async fn run_from_clients(ctx: Arc<RouterContext>, mut rx: mpsc::UnboundedReceiver<ClientLine>) {
    while let Some(item) = rx.recv().await {
        let queue_time = item.received_at.elapsed();
        let handle_start = Instant::now();
        handle_from_client(&ctx, item.client_id, &item.line).await;
        warn_on_slow_handling(&ctx, "client", queue_time, handle_start.elapsed());
    }
}

async fn handle_from_upstream(ctx: &Arc<RouterContext>, line: &str) {
    let Some(link) = ctx.upstream.read().await.clone() else {
        return;
    };

    let mut cache = ctx.cache.lock().await;
    let mut sharedinfo = ctx.sharedinfo.lock().await;
    let mut clients = ctx.clients.write().await;
    let mut last_load1 = ctx.last_load1.lock().await;
    let mut last_load3 = ctx.last_load3.lock().await;
    let mut conn = link.connection.lock().await;

    let outcome = {
        let mut rule_ctx = RuleContext {
            catalog: &ctx.catalog,
            cache: &mut cache,
            config: &ctx.config,
            sharedinfo: &mut sharedinfo,
            clients: &mut clients,
            own_uuid: &ctx.own_uuid,
            last_load1: &mut last_load1,
            last_load3: &mut last_load3,
        };
        let mut sender = Sender::Upstream(&mut conn);
        rules::route(&mut rule_ctx, line, &mut sender)
    };

    crate::traffic_log!(direction = "upstream", code = ?outcome.code, "{line}");

    match &outcome.action {
        // UpstreamOnly never comes back from an upstream-originated message
        // (the Rule Engine rejects `again`/`start`/`demand` from that side),
        // but the match stays exhaustive across both directions.
        RulesAction::Drop | RulesAction::UpstreamOnly => {}
        RulesAction::Disconnect => conn.base.outbound.send_line("exit"),
        RulesAction::Reply(text) => conn.base.outbound.send_line(text.clone()),
        RulesAction::Normal => {
            for client in clients.values() {
                client.base.outbound.send_line(line.to_string());
            }
        }
        RulesAction::Filter(filter) => {
            for client in clients.values_mut() {
                if egress_filter_excludes(filter, client) {
                    continue;
                }
                if let EgressFilter::Start { key } = filter {
                    client.welcome_keywords_sent.insert(key.clone());
                }
                client.base.outbound.send_line(line.to_string());
            }
        }
    }

    if let Some(extra) = &outcome.message {
        for client in clients.values() {
            client.base.outbound.send_line(extra.clone());
        }
    }
}

async fn handle_from_client(ctx: &Arc<RouterContext>, client_id: u64, line: &str) {
    let (outcome, outbound, gained_access) = {
        let mut cache = ctx.cache.lock().await;
        let mut sharedinfo = ctx.sharedinfo.lock().await;
        let mut clients = ctx.clients.write().await;
        let mut last_load1 = ctx.last_load1.lock().await;
        let mut last_load3 = ctx.last_load3.lock().await;

        let Some(mut client) = clients.remove(&client_id) else {
            return;
        };
        let had_access_before = client.has_access();

        let outcome = {
            let mut rule_ctx = RuleContext {
                catalog: &ctx.catalog,
                cache: &mut cache,
                config: &ctx.config,
                sharedinfo: &mut sharedinfo,
                clients: &mut clients,
                own_uuid: &ctx.own_uuid,
                last_load1: &mut last_load1,
                last_load3: &mut last_load3,
            };
            let mut sender = Sender::Client(&mut client);
            rules::route(&mut rule_ctx, line, &mut sender)
        };

        let gained_access = !had_access_before && client.has_access();
        let outbound = client.base.outbound.clone();
        clients.insert(client_id, client);

        if let Some(extra) = &outcome.message {
            for other in clients.values() {
                other.base.outbound.send_line(extra.clone());
            }
        }

        (outcome, outbound, gained_access)
    };

    crate::traffic_log!(direction = "client", client_id, code = ?outcome.code, "{line}");

    if gained_access {
        crate::listener::run_welcome(ctx, client_id, &outbound).await;
    }

    match &outcome.action {
        RulesAction::Drop => {}
        RulesAction::Disconnect => outbound.send_line("exit"),
        RulesAction::Reply(text) => outbound.send_line(text.clone()),
        RulesAction::Normal | RulesAction::Filter(_) | RulesAction::UpstreamOnly => {
            if let Some(link) = ctx.upstream.read().await.as_ref() {
                link.connection.lock().await.base.outbound.send_line(line.to_string());
            }
        }
    }
}

fn egress_filter_excludes(filter: &EgressFilter, client: &crate::connection::ClientConnection) -> bool {
    match filter {
        EgressFilter::NoLong => client.nolong,
        EgressFilter::ExcludeNonFrankenrouter => !client.base.is_frankenrouter,
        // Router peers always get a `start`-filtered value, since they will
        // relay it onward; an ordinary client only gets one while its own
        // welcome is in the awaiting-START window.
        EgressFilter::Start { key } => {
            if client.base.is_frankenrouter {
                false
            } else if client.waiting_for_start_keywords {
                client.welcome_keywords_sent.contains(key)
            } else {
                true
            }
        }
    }
}

fn warn_on_slow_handling(ctx: &RouterContext, direction: &str, queue_time: Duration, handling_time: Duration) {
    if queue_time > Duration::from_secs_f64(ctx.config.performance.queue_time_warning) {
        tracing::warn!(direction, ?queue_time, "queue time exceeded warning threshold");
    }
    if handling_time > Duration::from_secs_f64(ctx.config.performance.total_delay_warning) {
        tracing::warn!(direction, ?handling_time, "message handling exceeded warning threshold");
    }
}
