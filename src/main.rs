//! Process Bootstrap (C11): loads configuration, wires every collaborator, runs
//! the auto-start sequence, and serves the gateway until `Ctrl+C`. Grounded on the
//! teacher's own `main.rs`/`lib.rs` Tauri bootstrap — here there is no desktop
//! shell to hand control to, so this plays the part of `tauri::Builder::run`: the
//! one place that owns the process lifetime.

use std::net::SocketAddr;

use mcp_gateway::config::ConfigLoader;
use mcp_gateway::Gateway;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7332";
const DEFAULT_CONFIG_DIR: &str = "./config";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_dir = std::env::var("GATEWAY_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
    let loader = ConfigLoader::new(&config_dir);
    let config = match loader.load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load configuration from {config_dir}: {e}");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(env!("CARGO_PKG_VERSION"));

    let report = match gateway.auto_start(&config).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("fatal misconfiguration during auto-start: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        backends_started = report.backends_started,
        backends_failed = report.backends_failed,
        proxies_started = report.proxies_started,
        proxies_failed = report.proxies_failed,
        "auto-start finished"
    );

    let reaper_token = gateway.spawn_reaper();

    let listen_addr = std::env::var("GATEWAY_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let addr: SocketAddr = match listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("invalid GATEWAY_LISTEN_ADDR '{listen_addr}': {e}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("mcp-gateway listening on http://{addr}");
    let app = mcp_gateway::ingress::router(gateway.ingress_state());

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                tracing::error!("server error: {e}");
                std::process::exit(2);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining sessions");
        }
    }

    reaper_token.cancel();
    gateway.drain_sessions().await;
    tracing::info!("mcp-gateway shut down cleanly");
}
