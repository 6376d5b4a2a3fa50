//! HTTP front end serving OpenStack and EC2 style metadata.
//!
//! Node-dependent routes resolve the requesting node from the client IP on
//! the blocking thread pool, since the Ironic client is synchronous.

use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use actix_web::dev::{Payload, Service};
use actix_web::http::header::{self, HeaderMap};
use actix_web::{web, App, FromRequest, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use serde::Serialize;
use slog_scope::{error, info, warn};

use crate::ironic::Node;
use crate::metadata;
use crate::resolver::Resolver;

mod error;
pub use self::error::HandlerError;

/// Seconds in-flight requests get to finish on shutdown.
const SHUTDOWN_GRACE_PERIOD_S: u64 = 30;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub bind_port: u16,
    /// Worker threads, actix picks one per core when unset.
    pub workers: Option<usize>,
}

/// Serve metadata until SIGINT or SIGTERM.
pub async fn serve(resolver: Arc<Resolver>, settings: ServerSettings) -> Result<()> {
    let resolver = web::Data::from(resolver);

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(resolver.clone())
            .wrap_fn(|req, srv| {
                let started = Instant::now();
                let method = req.method().to_string();
                let path = req.path().to_string();
                let peer = req
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                let user_agent = req
                    .headers()
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let response = srv.call(req);
                async move {
                    let res = response.await?;
                    info!("request";
                        "method" => method,
                        "path" => path,
                        "peer" => peer,
                        "user_agent" => user_agent,
                        "status" => res.status().as_u16(),
                        "duration_ms" => started.elapsed().as_millis() as u64);
                    Ok(res)
                }
            })
            .configure(configure)
    })
    .shutdown_timeout(SHUTDOWN_GRACE_PERIOD_S);
    if let Some(workers) = settings.workers {
        server = server.workers(workers);
    }

    let server = server
        .bind((settings.bind_addr.as_str(), settings.bind_port))
        .with_context(|| {
            format!(
                "failed to bind to {}:{}",
                settings.bind_addr, settings.bind_port
            )
        })?;
    info!("serving metadata";
        "bind_addr" => &settings.bind_addr,
        "bind_port" => settings.bind_port);

    server.run().await.context("metadata server failed")?;
    info!("metadata server stopped");
    Ok(())
}

/// Register every metadata route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource(["/openstack", "/openstack/"]).route(web::get().to(openstack_versions)),
    )
    .service(
        web::resource(["/openstack/latest", "/openstack/latest/"])
            .route(web::get().to(openstack_documents)),
    )
    .service(web::resource("/openstack/latest/meta_data.json").route(web::get().to(meta_data)))
    .service(
        web::resource("/openstack/latest/network_data.json").route(web::get().to(network_data)),
    )
    .service(web::resource("/openstack/latest/user_data").route(web::get().to(user_data)))
    .service(
        web::resource("/openstack/latest/vendor_data.json").route(web::get().to(vendor_data)),
    )
    .service(
        web::resource("/openstack/latest/vendor_data2.json").route(web::get().to(vendor_data2)),
    )
    .service(web::resource("/").route(web::get().to(ec2_versions)))
    .service(web::resource(["/latest", "/latest/"]).route(web::get().to(ec2_endpoints)))
    .service(
        web::resource(["/latest/meta-data", "/latest/meta-data/"])
            .route(web::get().to(ec2_meta_data)),
    )
    .service(web::resource("/latest/user-data").route(web::get().to(user_data)));
}

/// The address of the requesting machine.
///
/// Taken from the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// TCP peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequest for ClientIp {
    type Error = HandlerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(match client_ip(req.headers(), req.peer_addr()) {
            Some(ip) => Ok(ClientIp(ip)),
            None => {
                error!("cannot determine client IP"; "path" => req.path());
                Err(HandlerError::Internal)
            }
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = header_str(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim);
    let real_ip = header_str(headers, X_REAL_IP).map(str::trim);

    forwarded
        .filter(|ip| !ip.is_empty())
        .or_else(|| real_ip.filter(|ip| !ip.is_empty()))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

async fn resolve_node(
    resolver: web::Data<Resolver>,
    client_ip: &ClientIp,
) -> Result<Node, HandlerError> {
    let ip = client_ip.0.clone();
    let resolved = web::block(move || resolver.resolve(&ip))
        .await
        .map_err(|e| {
            error!("node resolution did not complete: {}", e);
            HandlerError::Internal
        })?;
    resolved.map_err(|e| {
        warn!("failed to find node for client IP";
            "client_ip" => &client_ip.0,
            "error" => format!("{e:#}"));
        HandlerError::NodeNotFound
    })
}

fn json_response<T: Serialize>(document: &T) -> Result<HttpResponse, HandlerError> {
    let body = serde_json::to_string(document).map_err(|e| {
        error!("failed to encode JSON response: {}", e);
        HandlerError::Internal
    })?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(body))
}

fn text_response(body: String) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body(body)
}

async fn openstack_versions() -> Result<HttpResponse, HandlerError> {
    json_response(&metadata::OPENSTACK_VERSIONS)
}

async fn openstack_documents() -> Result<HttpResponse, HandlerError> {
    json_response(&metadata::OPENSTACK_DOCUMENTS)
}

async fn meta_data(
    resolver: web::Data<Resolver>,
    client_ip: ClientIp,
) -> Result<HttpResponse, HandlerError> {
    let node = resolve_node(resolver, &client_ip).await?;
    json_response(&metadata::build_instance_metadata(&node))
}

async fn network_data(
    resolver: web::Data<Resolver>,
    client_ip: ClientIp,
) -> Result<HttpResponse, HandlerError> {
    let node = resolve_node(resolver, &client_ip).await?;
    json_response(&metadata::build_network_topology(&node))
}

async fn user_data(
    resolver: web::Data<Resolver>,
    client_ip: ClientIp,
) -> Result<HttpResponse, HandlerError> {
    let node = resolve_node(resolver, &client_ip).await?;
    match metadata::build_user_data(&node) {
        user_data if user_data.is_empty() => Err(HandlerError::UserDataNotFound),
        user_data => Ok(text_response(user_data)),
    }
}

async fn vendor_data() -> Result<HttpResponse, HandlerError> {
    json_response(&metadata::vendor_data())
}

async fn vendor_data2() -> Result<HttpResponse, HandlerError> {
    json_response(&metadata::vendor_data2())
}

async fn ec2_versions() -> HttpResponse {
    text_response(metadata::EC2_VERSIONS.join("\n"))
}

async fn ec2_endpoints() -> HttpResponse {
    text_response(metadata::EC2_ENDPOINTS.join("\n"))
}

async fn ec2_meta_data(
    resolver: web::Data<Resolver>,
    client_ip: ClientIp,
) -> Result<HttpResponse, HandlerError> {
    let node = resolve_node(resolver, &client_ip).await?;
    Ok(text_response(metadata::build_ec2_metadata(&node, &client_ip.0)))
}
