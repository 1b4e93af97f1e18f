//! Transport Clients (C1): one uniform capability set regardless of backend
//! transport. Grounded on the teacher's `mcp::client::McpClient`, which wraps a
//! `Transport` enum over `StdioTransport`/`HttpTransport`; here it's a trait so the
//! registry can hold `Box<dyn Transport>` without matching on a closed enum at
//! every call site, since the gateway adds a third (EVENT) variant the teacher
//! never had.

pub mod event;
pub mod http;
pub mod local;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::mcp::types::{ClientInfo, HandshakeResult, ToolDef};

/// Inbound message delivered to a subscriber of `Transport::subscribe` — only
/// meaningful for LOCAL/EVENT backends, which can push notifications outside of
/// a request/response pair.
pub type InboundStream = mpsc::Receiver<Value>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn handshake(&self, client_info: ClientInfo, protocol_version: &str) -> Result<HandshakeResult>;
    async fn list_tools(&self) -> Result<Vec<ToolDef>>;
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value>;
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
    /// Subscribe to server-initiated messages. Returns `None` for transports
    /// (HTTP) that only ever produce one reply per call.
    fn subscribe(&self) -> Option<InboundStream>;
    async fn close(&self);
}
