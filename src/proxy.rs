//! Proxy Engine (C4): per-proxy routing table that filters a backend's tool
//! catalog, rewrites handshake responses, and forwards or locally answers every
//! JSON-RPC method a client can send. Grounded on the dispatch shape of the
//! teacher's `mcp/proxy.rs::handle_mcp_post` — generalized from "one server_id path
//! segment routed straight through" into a named proxy → backend mapping with its
//! own exposed-tool filter and instructions override.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::compliance;
use crate::config::ProxyConfig;
use crate::error::{GatewayError, Result};
use crate::mcp::types::{JsonRpcRequest, JsonRpcResponse, ToolDef};
use crate::registry::BackendRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Running,
    Error,
}

struct ProxyEntry {
    config: ProxyConfig,
    state: ProxyState,
    effective_tools: Option<Vec<ToolDef>>,
}

/// Methods handled entirely within the proxy, never forwarded to a backend.
const LOCAL_METHODS: &[&str] = &["initialize"];

pub struct ProxyEngine {
    gateway_name: String,
    gateway_version: String,
    registry: Arc<BackendRegistry>,
    proxies: tokio::sync::RwLock<HashMap<String, ProxyEntry>>,
}

impl ProxyEngine {
    pub fn new(gateway_name: impl Into<String>, gateway_version: impl Into<String>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            gateway_name: gateway_name.into(),
            gateway_version: gateway_version.into(),
            registry,
            proxies: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, config: ProxyConfig) -> Result<()> {
        let mut proxies = self.proxies.write().await;
        if proxies.contains_key(&config.name) {
            return Err(GatewayError::Config(format!("proxy '{}' already exists", config.name)));
        }
        proxies.insert(
            config.name.clone(),
            ProxyEntry {
                config,
                state: ProxyState::Stopped,
                effective_tools: None,
            },
        );
        Ok(())
    }

    /// Running requires the referenced backend to be Verified.
    pub async fn start(&self, name: &str) -> Result<()> {
        let backend_name = {
            let proxies = self.proxies.read().await;
            let entry = proxies
                .get(name)
                .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{name}'")))?;
            entry.config.backend_name.clone()
        };

        if !self.registry.is_verified(&backend_name).await {
            let mut proxies = self.proxies.write().await;
            if let Some(entry) = proxies.get_mut(name) {
                entry.state = ProxyState::Error;
            }
            return Err(GatewayError::BackendNotVerified(backend_name));
        }

        self.refresh_tools(name).await?;
        let mut proxies = self.proxies.write().await;
        if let Some(entry) = proxies.get_mut(name) {
            entry.state = ProxyState::Running;
        }
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut proxies = self.proxies.write().await;
        let entry = proxies
            .get_mut(name)
            .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{name}'")))?;
        entry.state = ProxyState::Stopped;
        Ok(())
    }

    /// Invalidates and recomputes the effective tool list cache from the backend's
    /// current catalog. Called on proxy start and on backend re-verification.
    pub async fn refresh_tools(&self, name: &str) -> Result<()> {
        let backend_name = {
            let proxies = self.proxies.read().await;
            let entry = proxies
                .get(name)
                .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{name}'")))?;
            entry.config.backend_name.clone()
        };

        let tools = self.registry.tools(&backend_name).await?;
        let mut proxies = self.proxies.write().await;
        if let Some(entry) = proxies.get_mut(name) {
            let filtered: Vec<ToolDef> = tools
                .into_iter()
                .filter(|t| entry.config.exposes(&t.name))
                .collect();
            entry.effective_tools = Some(filtered);
        }
        Ok(())
    }

    pub async fn proxy_names(&self) -> Vec<String> {
        self.proxies.read().await.keys().cloned().collect()
    }

    pub async fn backend_name_of(&self, proxy: &str) -> Result<String> {
        let proxies = self.proxies.read().await;
        proxies
            .get(proxy)
            .map(|e| e.config.backend_name.clone())
            .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{proxy}'")))
    }

    /// Every proxy currently routed to `backend_name`, for fanning a backend's
    /// pushed notifications out to the sessions of each.
    pub async fn proxy_names_for_backend(&self, backend_name: &str) -> Vec<String> {
        self.proxies
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.config.backend_name == backend_name)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn is_running(&self, proxy: &str) -> bool {
        self.proxies
            .read()
            .await
            .get(proxy)
            .map(|e| e.state == ProxyState::Running)
            .unwrap_or(false)
    }

    /// Dispatch a single JSON-RPC request per the §4.4 method table; returns the
    /// envelope to send back to the client (or forward onto a session queue).
    pub async fn dispatch(&self, proxy_name: &str, request: JsonRpcRequest) -> JsonRpcResponse {
        match self.try_dispatch(proxy_name, &request).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(e) => JsonRpcResponse::failure(request.id, e.json_rpc_code(), e.to_string()),
        }
    }

    /// Same dispatch as `dispatch`, but surfaces the raw `GatewayError` so callers
    /// that need an HTTP status (ingress) can use `GatewayError::http_status`.
    pub async fn try_dispatch(&self, proxy_name: &str, request: &JsonRpcRequest) -> Result<Value> {
        self.dispatch_inner(proxy_name, request).await
    }

    pub async fn endpoint_of(&self, proxy: &str) -> Result<String> {
        let proxies = self.proxies.read().await;
        proxies
            .get(proxy)
            .map(|e| e.config.endpoint.clone())
            .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{proxy}'")))
    }

    /// Fire-and-forget dispatch for `notifications/*` and other id-less messages.
    pub async fn dispatch_notification(&self, proxy_name: &str, request: JsonRpcRequest) {
        let backend_name = match self.backend_name_of(proxy_name).await {
            Ok(b) => b,
            Err(e) => {
                warn!(proxy = proxy_name, "cannot forward notification: {e}");
                return;
            }
        };
        if let Err(e) = self.registry.call(&backend_name, &request.method, request.params).await {
            warn!(proxy = proxy_name, method = request.method.as_str(), "notification forward failed: {e}");
        }
    }

    async fn dispatch_inner(&self, proxy_name: &str, request: &JsonRpcRequest) -> Result<Value> {
        if !self.is_running(proxy_name).await && !LOCAL_METHODS.contains(&request.method.as_str()) {
            return Err(GatewayError::ProxyNotRunning(proxy_name.to_string()));
        }

        match request.method.as_str() {
            "initialize" => self.handle_initialize(proxy_name, request).await,
            "tools/list" => self.handle_tools_list(proxy_name).await,
            "tools/call" => self.handle_tools_call(proxy_name, request).await,
            "resources/list" | "resources/templates/list" => {
                self.handle_resources(proxy_name, &request.method).await
            }
            other => {
                let backend_name = self.backend_name_of(proxy_name).await?;
                self.registry.call(&backend_name, other, request.params.clone()).await
            }
        }
    }

    async fn handle_initialize(&self, proxy_name: &str, request: &JsonRpcRequest) -> Result<Value> {
        let (backend_name, instructions_override) = {
            let proxies = self.proxies.read().await;
            let entry = proxies
                .get(proxy_name)
                .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{proxy_name}'")))?;
            (entry.config.backend_name.clone(), entry.config.instructions_override.clone())
        };

        let handshake = self.registry.handshake_result(&backend_name).await?;

        let requested = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or(&handshake.protocol_version);
        let protocol_version = compliance::negotiate_protocol_version(requested);

        // Instructions priority per §4.4: override, then backend's own, then omit.
        let instructions = instructions_override
            .filter(|s| !s.is_empty())
            .or(handshake.instructions.clone());

        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": handshake.capabilities,
            "serverInfo": {
                "name": format!("{}-{}", self.gateway_name, proxy_name),
                "version": self.gateway_version,
            },
        });
        // `json!` would serialize `None` as an explicit `null`; omit the key
        // entirely instead so an absent instructions field really is absent.
        if let Some(instructions) = instructions {
            result["instructions"] = json!(instructions);
        }

        Ok(result)
    }

    async fn handle_tools_list(&self, proxy_name: &str) -> Result<Value> {
        let proxies = self.proxies.read().await;
        let entry = proxies
            .get(proxy_name)
            .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{proxy_name}'")))?;
        let tools = entry.effective_tools.clone().unwrap_or_default();
        Ok(json!({ "tools": tools, "nextCursor": "" }))
    }

    async fn handle_tools_call(&self, proxy_name: &str, request: &JsonRpcRequest) -> Result<Value> {
        let tool_name = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::MethodNotFound("tools/call missing 'name'".to_string()))?;

        let (backend_name, exposed) = {
            let proxies = self.proxies.read().await;
            let entry = proxies
                .get(proxy_name)
                .ok_or_else(|| GatewayError::Config(format!("unknown proxy '{proxy_name}'")))?;
            let exposed = entry
                .effective_tools
                .as_ref()
                .map(|tools| tools.iter().any(|t| t.name == tool_name))
                .unwrap_or(false);
            (entry.config.backend_name.clone(), exposed)
        };

        if !exposed {
            return Err(GatewayError::ToolNotExposed(tool_name.to_string()));
        }

        self.registry.call(&backend_name, "tools/call", request.params.clone()).await
    }

    async fn handle_resources(&self, proxy_name: &str, method: &str) -> Result<Value> {
        let backend_name = self.backend_name_of(proxy_name).await?;
        let handshake = self.registry.handshake_result(&backend_name).await?;

        if handshake.capabilities.supports_resources() {
            return self.registry.call(&backend_name, method, Some(json!({}))).await;
        }

        Ok(compliance::synthesize_resources_result(method)
            .expect("method is one of the two resources/* names guarded by the caller"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn proxy_config(name: &str, backend: &str) -> ProxyConfig {
        ProxyConfig {
            name: name.to_string(),
            backend_name: backend.to_string(),
            endpoint: "/mcp".to_string(),
            transport: TransportKind::Http,
            exposed_tools: Vec::new(),
            instructions_override: None,
            auto_start: false,
        }
    }

    #[tokio::test]
    async fn start_fails_if_backend_not_verified() {
        let registry = Arc::new(BackendRegistry::new("test"));
        let engine = ProxyEngine::new("gateway", "0.1.0", registry);
        engine.create(proxy_config("p", "b")).await.unwrap();
        let err = engine.start("p").await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendNotVerified(_)));
    }

    #[tokio::test]
    async fn dispatch_before_running_returns_proxy_not_running() {
        let registry = Arc::new(BackendRegistry::new("test"));
        let engine = ProxyEngine::new("gateway", "0.1.0", registry);
        engine.create(proxy_config("p", "b")).await.unwrap();

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(1)),
            method: "tools/list".to_string(),
            params: None,
        };
        let response = engine.dispatch("p", request).await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let registry = Arc::new(BackendRegistry::new("test"));
        let engine = ProxyEngine::new("gateway", "0.1.0", registry);
        engine.create(proxy_config("p", "b")).await.unwrap();
        let err = engine.create(proxy_config("p", "b")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
