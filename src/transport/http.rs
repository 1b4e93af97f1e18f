//! HTTP transport: each call is a single POST of a JSON-RPC envelope; the reply is
//! either a plain JSON body or an SSE-framed stream that the client must tolerate.
//! Grounded on the teacher's `mcp/http_transport.rs::send_request` streamable-HTTP
//! path (session-id header threading, bearer injection, `extract_json_from_sse`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::mcp::types::{
    ClientCapabilities, ClientInfo, HandshakeResult, InitializeParams, JsonRpcRequest,
    JsonRpcResponse, RawToolDef, ServerCapabilities, ServerInfo, ToolCatalogReply,
};
use crate::compliance;

use super::{InboundStream, Transport};

const CALL_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

pub struct HttpTransport {
    backend_name: String,
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(backend_name: &str, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            backend_name: backend_name.to_string(),
            client: Client::new(),
            url: url.to_string(),
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::Number(id.into())),
            method: method.to_string(),
            params,
        };

        debug!(backend = self.backend_name.as_str(), method, id, "HTTP send_request");

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        {
            let sid = self.session_id.lock().await;
            if let Some(s) = sid.as_deref() {
                req = req.header("Mcp-Session-Id", s);
            }
        }

        let response = tokio::time::timeout(CALL_DEADLINE, req.json(&request).send())
            .await
            .map_err(|_| GatewayError::Timeout(format!("{method} (id={id})")))?
            .map_err(|e| GatewayError::ConnectFailed(format!("HTTP request failed: {e}")))?;

        if let Some(new_sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(new_sid.to_string());
        }

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::ConnectFailed(format!("{} requires auth", self.url)));
        }
        if !response.status().is_success() {
            let code = compliance::http_status_to_json_rpc_code(response.status().as_u16());
            return Err(GatewayError::PeerError {
                code,
                message: format!("HTTP request for {method} returned status {}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::ProtocolError(format!("failed to read HTTP response: {e}")))?;

        let json_text = if content_type.contains("text/event-stream") {
            extract_json_from_sse(&body)?
        } else {
            body
        };

        let rpc_response: JsonRpcResponse = serde_json::from_str(&json_text).map_err(|e| {
            GatewayError::ProtocolError(format!("failed to parse JSON-RPC response: {e} — raw: {json_text}"))
        })?;

        Ok(rpc_response)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn handshake(
        &self,
        client_info: ClientInfo,
        protocol_version: &str,
    ) -> Result<HandshakeResult> {
        let params = InitializeParams {
            protocol_version: protocol_version.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info,
        };
        let response = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;

        if let Some(err) = response.error {
            return Err(GatewayError::HandshakeRejected(self.backend_name.clone(), err.message));
        }
        let result = response
            .result
            .ok_or_else(|| GatewayError::HandshakeRejected(self.backend_name.clone(), "no result".into()))?;

        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawServerInfo {
            name: String,
            version: String,
            #[serde(default)]
            instructions: Option<String>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            protocol_version: String,
            #[serde(default)]
            capabilities: ServerCapabilities,
            server_info: RawServerInfo,
            #[serde(default)]
            instructions: Option<String>,
        }
        let raw: Raw = serde_json::from_value(result)
            .map_err(|e| GatewayError::HandshakeRejected(self.backend_name.clone(), e.to_string()))?;

        self.notify("notifications/initialized", None).await.ok();

        Ok(compliance::normalize_handshake_result(
            raw.protocol_version,
            raw.capabilities,
            ServerInfo {
                name: raw.server_info.name,
                version: raw.server_info.version,
            },
            raw.instructions,
            raw.server_info.instructions,
        ))
    }

    async fn list_tools(&self) -> Result<Vec<crate::mcp::types::ToolDef>> {
        let response = self
            .send_request("tools/list", Some(serde_json::json!({})))
            .await?;
        if let Some(err) = response.error {
            return Err(GatewayError::ToolListingRejected(self.backend_name.clone(), err.message));
        }
        let result = response.result.ok_or_else(|| {
            GatewayError::ToolListingRejected(self.backend_name.clone(), "no result".into())
        })?;
        let reply: ToolCatalogReply = serde_json::from_value(result)
            .map_err(|e| GatewayError::ToolListingRejected(self.backend_name.clone(), e.to_string()))?;

        Ok(reply
            .into_tools()
            .into_iter()
            .filter_map(|raw: RawToolDef| compliance::normalize_tool(raw, &self.backend_name))
            .collect())
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let response = self.send_request(method, params).await?;
        if let Some(err) = response.error {
            return Err(GatewayError::PeerError {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        };
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        {
            let sid = self.session_id.lock().await;
            if let Some(s) = sid.as_deref() {
                req = req.header("Mcp-Session-Id", s);
            }
        }
        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::ConnectFailed(format!("HTTP notify failed: {e}")))?;
        if let Some(new_sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(new_sid.to_string());
        }
        Ok(())
    }

    fn subscribe(&self) -> Option<InboundStream> {
        // HTTP produces exactly one reply per call; there is no server-push channel
        // to subscribe to.
        None
    }

    async fn close(&self) {}
}

/// Pull the JSON-RPC payload out of an SSE-framed HTTP response body. Only
/// `message`-typed (or untyped) `data:` lines are collected; the last complete
/// frame is the reply (streaming methods emit intermediate progress frames first).
fn extract_json_from_sse(body: &str) -> Result<String> {
    let mut json_parts = Vec::new();
    let mut current_event = String::new();

    for line in body.lines() {
        if let Some(event_type) = line.strip_prefix("event:") {
            current_event = event_type.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if current_event.is_empty() || current_event == "message" {
                json_parts.push(data.trim().to_string());
            }
        }
    }

    json_parts
        .last()
        .cloned()
        .ok_or_else(|| GatewayError::ProtocolError("no JSON data found in SSE response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_message_frame() {
        let body = "event: message\ndata: {\"a\":1}\n\nevent: message\ndata: {\"a\":2}\n\n";
        let json = extract_json_from_sse(body).unwrap();
        assert_eq!(json, r#"{"a":2}"#);
    }

    #[test]
    fn errors_when_no_data_frames() {
        assert!(extract_json_from_sse("event: ping\n\n").is_err());
    }
}
