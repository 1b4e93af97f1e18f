//! Backend Registry (C2): owns every `Backend` record and mediates all access to
//! its transport client. Grounded on the teacher's `state/server.rs` (`ServerConfig`/
//! `ServerStatus`) for the record shape and `commands/connections.rs`
//! (`connect_server`/`finalize_connection`/`mark_server_error`) for the
//! connect-handshake-discover choreography, generalized from two transports to three
//! and from a Tauri-state-guarded `Vec` to an async-native map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{BackendConfig, TransportKind};
use crate::error::{GatewayError, Result};
use crate::mcp::types::{ClientInfo, HandshakeResult, ToolDef, PROTOCOL_FALLBACK, PROTOCOL_PRIMARY};
use crate::transport::event::EventTransport;
use crate::transport::http::HttpTransport;
use crate::transport::local::LocalTransport;
use crate::transport::{InboundStream, Transport};

const TOOL_FETCH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Stopped,
    Starting,
    Running,
    Verified,
    Error,
}

pub struct Backend {
    pub config: BackendConfig,
    pub state: BackendState,
    pub last_error: Option<String>,
    pub started_at: Option<u64>,
    pub handshake_result: Option<HandshakeResult>,
    pub tools: Vec<ToolDef>,
    client: Option<Arc<dyn Transport>>,
}

impl Backend {
    fn new(config: BackendConfig) -> Self {
        Self {
            config,
            state: BackendState::Stopped,
            last_error: None,
            started_at: None,
            handshake_result: None,
            tools: Vec::new(),
            client: None,
        }
    }
}

/// Immutable point-in-time view of a `Backend`, safe to hand out to callers that
/// shouldn't be able to reach into the live registry (observability, `/status`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub state: BackendState,
    pub last_error: Option<String>,
    pub started_at: Option<u64>,
    pub tool_count: usize,
}

pub struct BackendRegistry {
    gateway_version: String,
    backends: RwLock<HashMap<String, Backend>>,
}

impl BackendRegistry {
    pub fn new(gateway_version: impl Into<String>) -> Self {
        Self {
            gateway_version: gateway_version.into(),
            backends: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, config: BackendConfig) -> Result<()> {
        let mut backends = self.backends.write().await;
        if backends.contains_key(&config.name) {
            return Err(GatewayError::Config(format!(
                "backend '{}' already exists",
                config.name
            )));
        }
        backends.insert(config.name.clone(), Backend::new(config));
        Ok(())
    }

    pub async fn update(&self, name: &str, config: BackendConfig) -> Result<()> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(name)
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
        backend.config = config;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.stop(name).await.ok();
        let mut backends = self.backends.write().await;
        backends
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }

    /// Idempotent: valid from `Stopped`/`Error`; a `Running`/`Verified` backend is
    /// left untouched. Takes `Arc<Self>` so a tool-fetch failure can schedule a
    /// retry that re-enters the registry after the §4.2 5 s backoff.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<()> {
        let config = {
            let backends = self.backends.read().await;
            let backend = backends
                .get(name)
                .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
            match backend.state {
                BackendState::Running | BackendState::Verified => return Ok(()),
                _ => {}
            }
            backend.config.clone()
        };

        {
            let mut backends = self.backends.write().await;
            if let Some(backend) = backends.get_mut(name) {
                backend.state = BackendState::Starting;
            }
        }

        let client: Result<Arc<dyn Transport>> = match config.transport {
            TransportKind::Local => {
                let command = config
                    .command
                    .clone()
                    .ok_or_else(|| GatewayError::Config(format!("backend '{name}' has no command")))?;
                LocalTransport::spawn(name, &command, &config.args, &config.env, config.cwd.as_deref())
                    .await
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
            }
            TransportKind::Event => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| GatewayError::Config(format!("backend '{name}' has no url")))?;
                connect_event_with_tiebreak(name, &url, config.headers.clone(), config.legacy_dual_endpoint).await
            }
            TransportKind::Http => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| GatewayError::Config(format!("backend '{name}' has no url")))?;
                Ok(Arc::new(HttpTransport::new(name, &url, config.headers.clone())))
            }
        };

        let client = match client {
            Ok(c) => c,
            Err(e) => {
                self.mark_error(name, e.to_string()).await;
                return Err(e);
            }
        };

        let client_info = ClientInfo {
            name: format!("{}-gateway", self.gateway_version),
            version: self.gateway_version.clone(),
        };

        let handshake = handshake_with_preference(client.as_ref(), client_info).await;
        let handshake_result = match handshake {
            Ok(h) => h,
            Err(e) => {
                client.close().await;
                self.mark_error(name, e.to_string()).await;
                return Err(e);
            }
        };

        {
            let mut backends = self.backends.write().await;
            if let Some(backend) = backends.get_mut(name) {
                backend.client = Some(client.clone());
                backend.handshake_result = Some(handshake_result);
                backend.state = BackendState::Running;
                backend.started_at = Some(unix_now());
                backend.last_error = None;
            }
        }

        match client.list_tools().await {
            Ok(tools) => {
                let mut backends = self.backends.write().await;
                if let Some(backend) = backends.get_mut(name) {
                    backend.tools = tools;
                    backend.state = BackendState::Verified;
                }
                info!(backend = name, "backend verified");
                Ok(())
            }
            Err(e) => {
                warn!(backend = name, "tool fetch failed after handshake: {e}");
                self.mark_error(name, e.to_string()).await;
                tokio::spawn(retry_tool_fetch(self.clone(), name.to_string()));
                Err(e)
            }
        }
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let client = {
            let mut backends = self.backends.write().await;
            let backend = backends
                .get_mut(name)
                .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
            backend.state = BackendState::Stopped;
            backend.client.take()
        };
        if let Some(client) = client {
            client.close().await;
        }
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn verify(&self, name: &str) -> Result<()> {
        let client = {
            let backends = self.backends.read().await;
            let backend = backends
                .get(name)
                .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
            backend
                .client
                .clone()
                .ok_or_else(|| GatewayError::BackendNotVerified(name.to_string()))?
        };

        let tools = client.list_tools().await?;
        let mut backends = self.backends.write().await;
        if let Some(backend) = backends.get_mut(name) {
            backend.tools = tools;
            backend.state = BackendState::Verified;
            backend.last_error = None;
        }
        Ok(())
    }

    pub async fn snapshot(&self, name: &str) -> Result<BackendSnapshot> {
        let backends = self.backends.read().await;
        let backend = backends
            .get(name)
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
        Ok(BackendSnapshot {
            name: name.to_string(),
            state: backend.state,
            last_error: backend.last_error.clone(),
            started_at: backend.started_at,
            tool_count: backend.tools.len(),
        })
    }

    pub async fn snapshot_all(&self) -> Vec<BackendSnapshot> {
        let backends = self.backends.read().await;
        let mut names: Vec<&String> = backends.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| {
                backends.get(name).map(|backend| BackendSnapshot {
                    name: name.clone(),
                    state: backend.state,
                    last_error: backend.last_error.clone(),
                    started_at: backend.started_at,
                    tool_count: backend.tools.len(),
                })
            })
            .collect()
    }

    pub async fn is_verified(&self, name: &str) -> bool {
        self.backends
            .read()
            .await
            .get(name)
            .map(|b| b.state == BackendState::Verified)
            .unwrap_or(false)
    }

    pub async fn names(&self) -> Vec<String> {
        self.backends.read().await.keys().cloned().collect()
    }

    /// Forward a `tools/call` (or any other method) to the backend's transport
    /// client. Refuses anything before `Verified` per §4.2 / §5 ordering guarantee.
    pub async fn call(&self, name: &str, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let client = {
            let backends = self.backends.read().await;
            let backend = backends
                .get(name)
                .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
            if backend.state != BackendState::Verified {
                return Err(GatewayError::BackendNotVerified(name.to_string()));
            }
            backend.client.clone().ok_or_else(|| GatewayError::BackendNotVerified(name.to_string()))?
        };
        client.call(method, params).await
    }

    pub async fn handshake_result(&self, name: &str) -> Result<HandshakeResult> {
        let backends = self.backends.read().await;
        let backend = backends
            .get(name)
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
        backend
            .handshake_result
            .clone()
            .ok_or_else(|| GatewayError::BackendNotVerified(name.to_string()))
    }

    /// Drain server-initiated messages pushed outside of a request/response pair.
    /// `None` if the backend is unknown, was never started, or its transport has
    /// no push channel (HTTP) or already handed its receiver to an earlier caller.
    pub async fn subscribe_backend(&self, name: &str) -> Option<InboundStream> {
        let backends = self.backends.read().await;
        backends.get(name)?.client.as_ref()?.subscribe()
    }

    pub async fn tools(&self, name: &str) -> Result<Vec<ToolDef>> {
        let backends = self.backends.read().await;
        let backend = backends
            .get(name)
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))?;
        Ok(backend.tools.clone())
    }

    async fn mark_error(&self, name: &str, message: String) {
        let mut backends = self.backends.write().await;
        if let Some(backend) = backends.get_mut(name) {
            backend.state = BackendState::Error;
            backend.last_error = Some(message);
        }
    }
}

/// Handshake with the preference list `[R_PRIMARY, R_FALLBACK]`, per §4.2: the
/// gateway offers its primary revision first and accepts whatever the backend
/// actually negotiates back.
async fn handshake_with_preference(
    client: &dyn Transport,
    client_info: ClientInfo,
) -> Result<HandshakeResult> {
    match client.handshake(client_info.clone(), PROTOCOL_PRIMARY).await {
        Ok(result) => Ok(result),
        Err(primary_err) => {
            warn!("handshake with {PROTOCOL_PRIMARY} failed: {primary_err}, retrying {PROTOCOL_FALLBACK}");
            client.handshake(client_info, PROTOCOL_FALLBACK).await
        }
    }
}

/// EVENT backends may have multiple endpoint candidates (legacy compatibility);
/// §4.2 says they're attempted in listed order and the first to complete handshake
/// wins. `EventTransport::connect` already races its own candidate list internally
/// for the SSE-establishment step, so this wrapper exists only to preserve the
/// last-seen connect error across the single candidate list it is given.
async fn connect_event_with_tiebreak(
    name: &str,
    url: &str,
    headers: HashMap<String, String>,
    legacy_dual_endpoint: bool,
) -> Result<Arc<dyn Transport>> {
    EventTransport::connect(name, url, headers, legacy_dual_endpoint)
        .await
        .map(|t| Arc::new(t) as Arc<dyn Transport>)
}

async fn retry_tool_fetch(registry: Arc<BackendRegistry>, name: String) {
    tokio::time::sleep(TOOL_FETCH_RETRY_BACKOFF).await;
    if let Err(e) = registry.verify(&name).await {
        warn!(backend = name.as_str(), "deferred tool-fetch retry failed: {e}");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_config(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: TransportKind::Local,
            command: Some("true".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            legacy_dual_endpoint: false,
            auto_start: false,
            instructions: None,
            depends_on: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let registry = BackendRegistry::new("test");
        registry.create(backend_config("a")).await.unwrap();
        let err = registry.create(backend_config("a")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn unknown_backend_operations_error() {
        let registry = BackendRegistry::new("test");
        assert!(matches!(
            registry.snapshot("missing").await.unwrap_err(),
            GatewayError::UnknownBackend(_)
        ));
        assert!(matches!(
            registry.stop("missing").await.unwrap_err(),
            GatewayError::UnknownBackend(_)
        ));
    }

    #[tokio::test]
    async fn call_before_verified_is_rejected() {
        let registry = BackendRegistry::new("test");
        registry.create(backend_config("a")).await.unwrap();
        let err = registry.call("a", "tools/call", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendNotVerified(_)));
    }

    #[tokio::test]
    async fn snapshot_all_is_sorted_by_name() {
        let registry = BackendRegistry::new("test");
        registry.create(backend_config("zeta")).await.unwrap();
        registry.create(backend_config("alpha")).await.unwrap();
        let names: Vec<String> = registry.snapshot_all().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
