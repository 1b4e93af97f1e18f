use serde::Serialize;

/// The six error kinds that cross every boundary in the gateway, from backend
/// handshake down to the JSON-RPC envelope returned to a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("cyclic backend dependency involving: {0}")]
    DependencyCycle(String),

    #[error("transport connect failed: {0}")]
    ConnectFailed(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("malformed frame from peer: {0}")]
    ProtocolError(String),

    #[error("peer returned an error: {code}: {message}")]
    PeerError { code: i64, message: String },

    #[error("backend '{0}' handshake rejected: {1}")]
    HandshakeRejected(String, String),

    #[error("backend '{0}' tool listing rejected: {1}")]
    ToolListingRejected(String, String),

    #[error("proxy '{0}' is not running")]
    ProxyNotRunning(String),

    #[error("backend '{0}' is not verified")]
    BackendNotVerified(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("tool not exposed: {0}")]
    ToolNotExposed(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session queue overflow (max {0})")]
    QueueOverflow(usize),

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("rate limit violation: {0}")]
    RateLimited(String),

    #[error("compliance normalization failed: {0}")]
    Compliance(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// Map this error onto a JSON-RPC error-code range, per §4.3 rule 5:
    /// server errors live in -32000..-32099.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            GatewayError::PeerError { code, .. } => *code,
            GatewayError::MethodNotFound(_) => -32601,
            GatewayError::ToolNotExposed(_) => -32601,
            GatewayError::ProtocolError(_) | GatewayError::Json(_) => -32700,
            GatewayError::Timeout(_) => -32001,
            GatewayError::ConnectFailed(_) | GatewayError::PeerClosed => -32002,
            GatewayError::ProxyNotRunning(_) | GatewayError::BackendNotVerified(_) => -32003,
            GatewayError::AdmissionRejected(_) | GatewayError::RateLimited(_) => -32004,
            GatewayError::UnknownSession(_) => -32005,
            GatewayError::QueueOverflow(_) => -32006,
            _ => -32000,
        }
    }

    /// Map to the HTTP status the ingress layer should return for this error (§6 status mapping).
    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            GatewayError::UnknownBackend(_) | GatewayError::UnknownSession(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::AdmissionRejected(_) | GatewayError::RateLimited(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::BackendNotVerified(_) | GatewayError::ProxyNotRunning(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::ProtocolError(_) | GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
