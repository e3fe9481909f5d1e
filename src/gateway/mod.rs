//! # Loopback Gateway
//!
//! A small in-process backend that speaks the same protocol as the production gateway:
//! an input WebSocket, an output WebSocket per task, the stop endpoint and `/health`.
//! It backs the end-to-end tests and `turnlink serve` for local development.
//!
//! ## Middleware Order:
//! Middleware wraps in reverse order for responses, so `RequestLogging` sees the request
//! first and the CORS layer last.

pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
pub mod websocket;

use crate::config::AppConfig;
use actix_cors::Cors;
use actix_web::{dev::Server, middleware::Logger, web, App, HttpServer};
use std::net::SocketAddr;
use tracing::info;
use tracing_actix_web::TracingLogger;

pub use state::{
    GatewayState, OutputAttach, Reply, ReplyEvent, StopOutcome, TaskOutcome, TaskPhase,
};

/// Bind the gateway on `config.server.host:config.server.port` without starting it.
///
/// Port `0` picks a free port; the bound addresses are returned so callers can build
/// the client URLs from them.
pub fn bind(config: &AppConfig, state: GatewayState) -> std::io::Result<(Server, Vec<SocketAddr>)> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let input_route = config.gateway.input_route();
    let output_route = config.gateway.output_route();
    let stop_route = config.gateway.stop_route();

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestLogging)
            .route(&input_route, web::get().to(websocket::input_socket))
            .route(&output_route, web::get().to(websocket::output_socket))
            .route(&stop_route, web::post().to(handlers::stop_task))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?;

    let addrs = server.addrs();
    info!("Gateway bound on {:?}", addrs);
    Ok((server.run(), addrs))
}

/// Point a client configuration at a bound gateway address.
pub fn client_config_for(base: &AppConfig, addr: SocketAddr) -> AppConfig {
    let mut config = base.clone();
    config.gateway.ws_base_url = format!("ws://{}", addr);
    config.gateway.http_base_url = format!("http://{}", addr);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_for_bound_address() {
        let addr: SocketAddr = "127.0.0.1:45123".parse().unwrap();
        let config = client_config_for(&AppConfig::default(), addr);
        assert_eq!(config.gateway.input_url(), "ws://127.0.0.1:45123/ws/input");
        assert_eq!(config.gateway.stop_url(), "http://127.0.0.1:45123/control/stop");
    }
}
