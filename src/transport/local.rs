//! LOCAL transport: spawns a child process and speaks newline-delimited JSON-RPC
//! over its stdin/stdout. Grounded on the teacher's `mcp/transport.rs::StdioTransport`
//! — same stdin-writer-task / stdout-reader-task / pending-oneshot-map shape, minus
//! the Tauri shell plugin: the child is spawned directly via `tokio::process::Command`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::error::{GatewayError, Result};
use crate::mcp::types::{
    ClientCapabilities, ClientInfo, HandshakeResult, InitializeParams, JsonRpcRequest,
    JsonRpcResponse, RawToolDef, ServerCapabilities, ServerInfo, ToolCatalogReply,
};
use crate::compliance;

use super::{InboundStream, Transport};

const KILL_GRACE: Duration = Duration::from_secs(3);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);
const CALL_DEADLINE: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct LocalTransport {
    backend_name: String,
    next_id: AtomicU64,
    stdin_tx: mpsc::Sender<String>,
    pending: PendingMap,
    notify_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    child: Mutex<Option<Child>>,
}

impl LocalTransport {
    pub async fn spawn(
        backend_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::ConnectFailed(format!("failed to spawn {command}: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::ConnectFailed("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::ConnectFailed("child has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::ConnectFailed("child has no stderr".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("failed to write to child stdin: {e}");
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let (notify_tx_reader, notify_rx) = mpsc::channel::<Value>(64);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(line) {
                            Ok(response) => {
                                if let Some(Value::Number(n)) = &response.id {
                                    if let Some(id) = n.as_u64() {
                                        let mut map = pending_clone.lock().await;
                                        if let Some(sender) = map.remove(&id) {
                                            let _ = sender.send(response);
                                            continue;
                                        }
                                    }
                                }
                                if let Some(result) = response.result {
                                    let _ = notify_tx_reader.send(result).await;
                                }
                            }
                            Err(e) => warn!("failed to parse JSON-RPC line: {e} — raw: {line}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("error reading child stdout: {e}");
                        break;
                    }
                }
            }
            debug!("LOCAL backend stdout closed");
        });

        let stderr_backend_name = backend_name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    debug!(backend = stderr_backend_name.as_str(), "stderr: {line}");
                }
            }
        });

        Ok(Self {
            backend_name: backend_name.to_string(),
            next_id: AtomicU64::new(1),
            stdin_tx,
            pending,
            notify_rx: Mutex::new(Some(notify_rx)),
            child: Mutex::new(Some(child)),
        })
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::Number(id.into())),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&request)?;
        self.stdin_tx
            .send(format!("{line}\n"))
            .await
            .map_err(|_| GatewayError::PeerClosed)?;

        let response = tokio::time::timeout(CALL_DEADLINE, rx)
            .await
            .map_err(|_| GatewayError::Timeout(format!("{method} (id={id})")))?
            .map_err(|_| GatewayError::PeerClosed)?;

        Ok(response)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
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

        let response = tokio::time::timeout(
            HANDSHAKE_DEADLINE,
            self.send_request("initialize", Some(serde_json::to_value(&params)?)),
        )
        .await
        .map_err(|_| GatewayError::Timeout("initialize".to_string()))??;

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
        let response = tokio::time::timeout(
            HANDSHAKE_DEADLINE,
            self.send_request("tools/list", Some(serde_json::json!({}))),
        )
        .await
        .map_err(|_| GatewayError::Timeout("tools/list".to_string()))??;

        let result = response.result.ok_or_else(|| {
            GatewayError::ToolListingRejected(self.backend_name.clone(), "no result".into())
        })?;

        let reply: ToolCatalogReply = serde_json::from_value(result)
            .map_err(|e| GatewayError::ToolListingRejected(self.backend_name.clone(), e.to_string()))?;

        let tools: Vec<_> = reply
            .into_tools()
            .into_iter()
            .filter_map(|raw: RawToolDef| compliance::normalize_tool(raw, &self.backend_name))
            .collect();

        Ok(tools)
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
        let line = serde_json::to_string(&request)?;
        self.stdin_tx
            .send(format!("{line}\n"))
            .await
            .map_err(|_| GatewayError::PeerClosed)
    }

    fn subscribe(&self) -> Option<InboundStream> {
        self.notify_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    async fn close(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(id) = child.id() {
                debug!(backend = self.backend_name.as_str(), pid = id, "terminating LOCAL backend");
            }
            let wait = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            if wait.is_err() {
                let _ = child.kill().await;
            }
        }
    }
}
