//! Unified multi-transport gateway for the Model Context Protocol: fronts any
//! number of MCP backends (LOCAL/EVENT/HTTP) behind named proxies with a single,
//! compliant wire surface. Module layout mirrors the teacher's `mcp`/`state`/
//! `commands` split, collapsed into one library crate per component (C1-C12).

pub mod admission;
pub mod autostart;
pub mod compliance;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ingress;
pub mod mcp;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod transport;

use std::sync::Arc;

use crate::admission::{AdmissionConfig, RateLimiter};
use crate::config::GatewayConfigDoc;
use crate::proxy::ProxyEngine;
use crate::registry::BackendRegistry;
use crate::session::SessionManager;

/// Every long-lived collaborator the process needs, wired once in `main` and
/// handed to C9 (auto-start) and C7 (ingress) as `Arc` handles.
pub struct Gateway {
    pub registry: Arc<BackendRegistry>,
    pub proxies: Arc<ProxyEngine>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl Gateway {
    pub fn new(gateway_version: impl Into<String>) -> Self {
        let gateway_version = gateway_version.into();
        let registry = Arc::new(BackendRegistry::new(gateway_version.clone()));
        let proxies = Arc::new(ProxyEngine::new("mcp-gateway", gateway_version, registry.clone()));
        let sessions = Arc::new(SessionManager::new());
        let rate_limiter = Arc::new(RateLimiter::new(AdmissionConfig::default()));
        Self {
            registry,
            proxies,
            sessions,
            rate_limiter,
        }
    }

    pub async fn auto_start(&self, config: &GatewayConfigDoc) -> crate::error::Result<autostart::AutoStartReport> {
        autostart::run(config, &self.registry, &self.proxies, &self.sessions).await
    }

    pub fn ingress_state(&self) -> Arc<ingress::GatewayState> {
        Arc::new(ingress::GatewayState {
            proxies: self.proxies.clone(),
            sessions: self.sessions.clone(),
            rate_limiter: self.rate_limiter.clone(),
        })
    }

    /// Spawns the session reaper. Returns its cancellation token for shutdown.
    pub fn spawn_reaper(&self) -> tokio_util::sync::CancellationToken {
        self.sessions.spawn_reaper()
    }

    /// Cancels every live session, used on graceful shutdown (§4.11).
    pub async fn drain_sessions(&self) {
        for session in self.sessions.all().await {
            self.sessions.remove(&session.id).await;
        }
    }
}
