//! EVENT transport: a long-lived `GET .../sse` carries server-to-client frames;
//! outbound requests POST to a message endpoint discovered from the stream's
//! `endpoint` event. Grounded on the teacher's `mcp/http_transport.rs` legacy-SSE
//! path (`connect_legacy_sse`, `parse_endpoint_from_sse`, `dispatch_sse_responses`,
//! `drain_consumed_events`) with the supervised reconnect-with-backoff loop shaped
//! after the session lifecycle in the agentgateway `session.rs` example.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{oneshot, mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::mcp::types::{
    ClientCapabilities, ClientInfo, HandshakeResult, InitializeParams, JsonRpcRequest,
    JsonRpcResponse, RawToolDef, ServerCapabilities, ServerInfo, ToolCatalogReply,
};
use crate::compliance;

use super::{InboundStream, Transport};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const CONNECT_DEADLINE: Duration = Duration::from_secs(15);
const CALL_DEADLINE: Duration = Duration::from_secs(60);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

pub struct EventTransport {
    backend_name: String,
    client: Client,
    headers: HashMap<String, String>,
    next_id: AtomicU64,
    post_url: Arc<Mutex<Option<String>>>,
    pending: PendingMap,
    notify_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    connected: Arc<Notify>,
    shutdown: CancellationToken,
}

impl EventTransport {
    /// Begin the supervised connection. Returns once the first attempt has either
    /// established a stream or exhausted its candidate list — subsequent drops are
    /// retried in the background without the caller blocking again.
    pub async fn connect(
        backend_name: &str,
        url: &str,
        headers: HashMap<String, String>,
        legacy_dual_endpoint: bool,
    ) -> Result<Self> {
        let client = Client::new();
        let post_url = Arc::new(Mutex::new(None));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::channel::<Value>(64);
        let connected = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let candidates = if legacy_dual_endpoint {
            vec![url.to_string(), format!("{}/mcp/sse", url.trim_end_matches('/'))]
        } else {
            vec![url.to_string()]
        };

        let transport = Self {
            backend_name: backend_name.to_string(),
            client: client.clone(),
            headers: headers.clone(),
            next_id: AtomicU64::new(1),
            post_url: post_url.clone(),
            pending: pending.clone(),
            notify_rx: Mutex::new(Some(notify_rx)),
            connected: connected.clone(),
            shutdown: shutdown.clone(),
        };

        let backend_name = backend_name.to_string();
        tokio::spawn(supervise(
            backend_name,
            client,
            headers,
            candidates,
            post_url,
            pending,
            notify_tx,
            connected,
            shutdown,
        ));

        Ok(transport)
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id_str = id.to_string();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::Number(id.into())),
            method: method.to_string(),
            params,
        };

        let post_url = self
            .post_url
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::ConnectFailed(format!("{} has no message endpoint yet", self.backend_name)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id_str.clone(), tx);

        let mut req = self
            .client
            .post(&post_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req.json(&request).send().await.map_err(|e| {
            GatewayError::ConnectFailed(format!("EVENT POST failed: {e}"))
        })?;

        if !response.status().is_success() {
            self.pending.lock().await.remove(&id_str);
            return Err(GatewayError::ConnectFailed(format!(
                "EVENT POST for {method} returned status {}",
                response.status()
            )));
        }

        let response = tokio::time::timeout(CALL_DEADLINE, rx)
            .await
            .map_err(|_| {
                GatewayError::Timeout(format!("{method} (id={id_str})"))
            })?
            .map_err(|_| GatewayError::PeerClosed)?;

        Ok(response)
    }
}

#[async_trait::async_trait]
impl Transport for EventTransport {
    async fn handshake(
        &self,
        client_info: ClientInfo,
        protocol_version: &str,
    ) -> Result<HandshakeResult> {
        self.connected.notified().await;

        let params = InitializeParams {
            protocol_version: protocol_version.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info,
        };
        let response = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;

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
        let post_url = self.post_url.lock().await.clone().ok_or_else(|| {
            GatewayError::ConnectFailed(format!("{} has no message endpoint yet", self.backend_name))
        })?;
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        };
        let mut req = self
            .client
            .post(&post_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::ConnectFailed(format!("EVENT notify failed: {e}")))?;
        if !response.status().is_success() {
            warn!(
                backend = self.backend_name.as_str(),
                "EVENT notification {method} returned status {}",
                response.status()
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> Option<InboundStream> {
        self.notify_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    backend_name: String,
    client: Client,
    headers: HashMap<String, String>,
    candidates: Vec<String>,
    post_url: Arc<Mutex<Option<String>>>,
    pending: PendingMap,
    notify_tx: mpsc::Sender<Value>,
    connected: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut last_err = None;
        let mut established = None;
        for candidate in &candidates {
            match connect_stream(&client, candidate, &headers).await {
                Ok(stream_ctx) => {
                    established = Some(stream_ctx);
                    break;
                }
                Err(e) => {
                    warn!(backend = backend_name.as_str(), candidate = candidate.as_str(), "EVENT connect attempt failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        let Some((discovered_post_url, stream, mut buffer)) = established else {
            error!(backend = backend_name.as_str(), "all EVENT candidates failed: {:?}", last_err);
            if sleep_with_jitter(backoff, &shutdown).await {
                return;
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
            continue;
        };

        backoff = BACKOFF_INITIAL;
        *post_url.lock().await = Some(discovered_post_url);
        connected.notify_waiters();
        info!(backend = backend_name.as_str(), "EVENT stream established");

        read_loop(&backend_name, stream, &mut buffer, &pending, &notify_tx, &shutdown).await;

        *post_url.lock().await = None;
        if shutdown.is_cancelled() {
            return;
        }
        warn!(backend = backend_name.as_str(), "EVENT stream dropped, reconnecting");
    }
}

type ByteStream = std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

async fn connect_stream(
    client: &Client,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<(String, ByteStream, String)> {
    let mut req = client.get(url).header("Accept", "text/event-stream");
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }

    let response = req
        .send()
        .await
        .map_err(|e| GatewayError::ConnectFailed(format!("EVENT GET failed: {e}")))?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(GatewayError::ConnectFailed(format!("{url} requires auth")));
    }
    if !response.status().is_success() {
        return Err(GatewayError::ConnectFailed(format!(
            "EVENT endpoint returned status {}",
            response.status()
        )));
    }

    let mut stream: ByteStream = Box::pin(response.bytes_stream());
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + CONNECT_DEADLINE;

    let post_url = loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                let text = String::from_utf8_lossy(&chunk).replace("\r\n", "\n");
                buffer.push_str(&text);
                if let Some(found) = parse_endpoint_from_sse(&buffer, url) {
                    break found;
                }
            }
            Ok(Some(Err(e))) => {
                return Err(GatewayError::ConnectFailed(format!("EVENT stream error: {e}")));
            }
            Ok(None) | Err(_) => {
                return Err(GatewayError::Timeout(format!("waiting for endpoint event on {url}")));
            }
        }
    };

    let remaining = drain_consumed_events(&buffer);
    Ok((post_url, stream, remaining))
}

async fn read_loop(
    backend_name: &str,
    mut stream: ByteStream,
    buffer: &mut String,
    pending: &PendingMap,
    notify_tx: &mpsc::Sender<Value>,
    shutdown: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                        buffer.push_str(&text);
                        dispatch_sse_events(buffer, pending, notify_tx).await;
                    }
                    Some(Err(e)) => {
                        error!(backend = backend_name, "EVENT stream error: {e}");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

fn parse_endpoint_from_sse(body: &str, base_url: &str) -> Option<String> {
    let mut current_event = String::new();
    for line in body.lines() {
        if let Some(event_type) = line.strip_prefix("event:") {
            current_event = event_type.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if current_event == "endpoint" {
                let endpoint = data.trim();
                if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    return Some(endpoint.to_string());
                }
                if let Ok(base) = url::Url::parse(base_url) {
                    if let Ok(joined) = base.join(endpoint) {
                        return Some(joined.to_string());
                    }
                }
                return Some(format!("{}/{}", base_url.trim_end_matches('/'), endpoint.trim_start_matches('/')));
            }
        }
    }
    None
}

fn drain_consumed_events(buffer: &str) -> String {
    for marker in ["event: endpoint", "event:endpoint"] {
        if let Some(idx) = buffer.find(marker) {
            if let Some(end) = buffer[idx..].find("\n\n") {
                let after = idx + end + 2;
                if after < buffer.len() {
                    return buffer[after..].to_string();
                }
            }
        }
    }
    String::new()
}

async fn dispatch_sse_events(buffer: &mut String, pending: &PendingMap, notify_tx: &mpsc::Sender<Value>) {
    loop {
        let Some(event_end) = buffer.find("\n\n") else {
            break;
        };
        let event_block = buffer[..event_end].to_string();
        *buffer = buffer[event_end + 2..].to_string();

        let mut event_type = String::new();
        let mut data_parts = Vec::new();
        for line in event_block.lines() {
            if let Some(et) = line.strip_prefix("event:") {
                event_type = et.trim().to_string();
            } else if let Some(d) = line.strip_prefix("data:") {
                data_parts.push(d.trim().to_string());
            }
        }

        if !event_type.is_empty() && event_type != "message" {
            debug!("EVENT: ignoring event type={event_type}");
            continue;
        }
        if data_parts.is_empty() {
            continue;
        }

        let json_text = data_parts.join("");
        let rpc_response: JsonRpcResponse = match serde_json::from_str(&json_text) {
            Ok(r) => r,
            Err(e) => {
                warn!("EVENT: failed to parse frame: {e} — raw: {json_text}");
                continue;
            }
        };

        let id_str = match &rpc_response.id {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        if let Some(id_str) = id_str {
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&id_str) {
                let _ = tx.send(rpc_response);
                continue;
            }
        }
        if let Some(result) = rpc_response.result {
            let _ = notify_tx.send(result).await;
        }
    }
}

async fn sleep_with_jitter(base: Duration, shutdown: &CancellationToken) -> bool {
    let jitter_frac = rand::rng().random_range(-0.2..=0.2);
    let millis = (base.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(millis)) => false,
        _ = shutdown.cancelled() => true,
    }
}
