//! Auto-Start Orchestrator (C9): brings backends and proxies up in dependency
//! order at process start. Grounded on `commands/connections.rs::reconnect_on_startup`
//! — poll-until-ready, then a per-item try/log-and-continue loop that never lets one
//! failure block the rest of the batch.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{topo_sort_backends, GatewayConfigDoc};
use crate::error::Result;
use crate::proxy::ProxyEngine;
use crate::registry::BackendRegistry;
use crate::session::SessionManager;

#[derive(Debug, Default)]
pub struct AutoStartReport {
    pub backends_started: usize,
    pub backends_failed: usize,
    pub proxies_started: usize,
    pub proxies_failed: usize,
}

/// Runs the full §4.9 sequence: topo-sort backends, start the auto-start ones in
/// order, then start auto-start proxies whose backend ended up Verified. A cyclic
/// backend dependency is propagated to the caller, which per §6 treats it as a
/// fatal misconfiguration (process exit code 1) — everything else here degrades
/// to a logged failure and keeps going.
pub async fn run(
    config: &GatewayConfigDoc,
    registry: &Arc<BackendRegistry>,
    proxies: &Arc<ProxyEngine>,
    sessions: &Arc<SessionManager>,
) -> Result<AutoStartReport> {
    let order = topo_sort_backends(&config.backends)?;
    let mut report = AutoStartReport::default();

    for name in &order {
        let backend_cfg = &config.backends[name];
        registry.create(backend_cfg.clone()).await.ok();
        if !backend_cfg.auto_start {
            continue;
        }
        match registry.start(name).await {
            Ok(()) => {
                info!(backend = name.as_str(), "auto-started backend");
                report.backends_started += 1;
                spawn_notification_fanout(registry.clone(), proxies.clone(), sessions.clone(), name.clone());
            }
            Err(e) => {
                warn!(backend = name.as_str(), "auto-start failed: {e}");
                report.backends_failed += 1;
            }
        }
    }

    let mut proxy_names: Vec<&String> = config.proxies.keys().collect();
    proxy_names.sort();
    for name in proxy_names {
        let proxy_cfg = &config.proxies[name];
        proxies.create(proxy_cfg.clone()).await.ok();
        if !proxy_cfg.auto_start {
            continue;
        }
        if !registry.is_verified(&proxy_cfg.backend_name).await {
            warn!(proxy = name.as_str(), backend = proxy_cfg.backend_name.as_str(), "skipping auto-start, backend not verified");
            report.proxies_failed += 1;
            continue;
        }
        match proxies.start(name).await {
            Ok(()) => {
                info!(proxy = name.as_str(), "auto-started proxy");
                report.proxies_started += 1;
            }
            Err(e) => {
                error!(proxy = name.as_str(), "auto-start failed: {e}");
                report.proxies_failed += 1;
            }
        }
    }

    info!(
        backends_started = report.backends_started,
        backends_failed = report.backends_failed,
        proxies_started = report.proxies_started,
        proxies_failed = report.proxies_failed,
        "auto-start complete"
    );

    Ok(report)
}

/// Splices a backend's server-pushed notifications back onto every session of
/// every proxy currently routed to it (§4.5). Looks the proxy set up fresh on
/// each message rather than once at spawn time, since proxies may start or stop
/// for this backend for as long as the backend itself stays up.
fn spawn_notification_fanout(
    registry: Arc<BackendRegistry>,
    proxies: Arc<ProxyEngine>,
    sessions: Arc<SessionManager>,
    backend_name: String,
) {
    tokio::spawn(async move {
        let Some(mut inbound) = registry.subscribe_backend(&backend_name).await else {
            return;
        };
        while let Some(message) = inbound.recv().await {
            let routed_proxies = proxies.proxy_names_for_backend(&backend_name).await;
            if routed_proxies.is_empty() {
                continue;
            }
            for session in sessions.all().await {
                if !routed_proxies.contains(&session.proxy_name) {
                    continue;
                }
                if let Err(e) = session.enqueue(message.clone()) {
                    warn!(session = session.id.as_str(), backend = backend_name.as_str(), "failed to enqueue backend notification: {e}");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ProxyConfig, TransportKind};
    use std::collections::{HashMap, HashSet};

    fn backend(name: &str, auto_start: bool) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some("http://127.0.0.1:1/mcp".to_string()),
            headers: HashMap::new(),
            legacy_dual_endpoint: false,
            auto_start,
            instructions: None,
            depends_on: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn skips_proxies_whose_backend_never_verifies() {
        let mut backends = HashMap::new();
        backends.insert("b".to_string(), backend("b", false));
        let mut proxies = HashMap::new();
        proxies.insert(
            "p".to_string(),
            ProxyConfig {
                name: "p".to_string(),
                backend_name: "b".to_string(),
                endpoint: "/mcp".to_string(),
                transport: TransportKind::Http,
                exposed_tools: Vec::new(),
                instructions_override: None,
                auto_start: true,
            },
        );
        let config = GatewayConfigDoc { backends, proxies };

        let registry = Arc::new(BackendRegistry::new("test"));
        let proxy_engine = Arc::new(ProxyEngine::new("gw", "0.1.0", registry.clone()));
        let sessions = Arc::new(SessionManager::new());

        let report = run(&config, &registry, &proxy_engine, &sessions).await.unwrap();
        assert_eq!(report.backends_started, 0);
        assert_eq!(report.proxies_failed, 1);
    }
}
