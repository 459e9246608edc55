//! # Control API
//!
//! A minimal HTTP surface for operators: list connected clients, and
//! request the upstream target change. Runs on its own OS thread with its
//! own actix `System`, the way the rest of this codebase isolates each
//! long-running server loop from the tasks it serves.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};

use crate::context::RouterContext;

#[derive(Serialize)]
struct ClientSummary {
    client_id: u64,
    ip: String,
    port: u16,
    display_name: String,
    access_level: String,
    is_frankenrouter: bool,
}

async fn get_clients(ctx: web::Data<Arc<RouterContext>>) -> HttpResponse {
    let clients = ctx.clients.read().await;
    let summary: Vec<ClientSummary> = clients
        .values()
        .map(|c| ClientSummary {
            client_id: c.client_id,
            ip: c.base.peer.ip().to_string(),
            port: c.base.peer.port(),
            display_name: c.base.display_name.clone(),
            access_level: format!("{:?}", c.access_level),
            is_frankenrouter: c.base.is_frankenrouter,
        })
        .collect();
    HttpResponse::Ok().json(summary)
}

#[derive(Deserialize)]
struct UpstreamSetRequest {
    host: String,
    port: u16,
}

/// Redirects the Upstream Connector's next dial target. Takes effect on
/// the next reconnect attempt; does not force-close a live connection.
async fn set_upstream(
    ctx: web::Data<Arc<RouterContext>>,
    body: web::Json<UpstreamSetRequest>,
) -> HttpResponse {
    tracing::info!(host = %body.host, port = body.port, "upstream target changed via control API");
    *ctx.upstream_target.write().await = (body.host.clone(), body.port);
    HttpResponse::Accepted().finish()
}

fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/clients", web::get().to(get_clients))
        .route("/upstream/set", web::post().to(set_upstream));
}

pub fn spawn(ctx: Arc<RouterContext>, port: u16) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        let result = system.block_on(async move {
            HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ctx.clone()))
                    .wrap(actix_web::middleware::Logger::default())
                    .wrap(Cors::permissive())
                    .configure(configure)
            })
            .bind(("0.0.0.0", port))
            .expect("failed to bind control API port")
            .workers(2)
            .run()
            .await
        });
        if let Err(e) = result {
            tracing::error!(error = %e, "control API server exited");
        }
    })
}
