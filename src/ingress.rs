//! Request Ingress (C7): the gateway's single HTTP surface, routing by path into
//! either the Proxy Engine (C4, synchronous calls) or the Session Manager (C5, EVENT
//! streams). Grounded on the teacher's `mcp/proxy.rs::start_proxy` — one `axum::Router`
//! per process, `handle_mcp_get`/`handle_mcp_post` split by method — generalized from
//! one fixed `/mcp/{server_id}` route to a dynamic `{proxyName}{proxyEndpoint}` table
//! looked up at request time instead of registered per proxy (axum routers are
//! immutable once served, so the "route table" lives in `ProxyEngine`'s own state).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State as AxumState};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admission::RateLimiter;
use crate::mcp::types::{JsonRpcRequest, JsonRpcResponse};
use crate::proxy::ProxyEngine;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct GatewayState {
    pub proxies: Arc<ProxyEngine>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn accepts_sse(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Splits `/{proxyName}/rest...` into (`proxyName`, `/rest...`).
fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((proxy, rest)) => (proxy.to_string(), format!("/{rest}")),
        None => (trimmed.to_string(), String::new()),
    }
}

async fn dispatch(
    AxumState(state): AxumState<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Response {
    let (proxy_name, rest) = split_path(uri.path());
    if proxy_name.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let endpoint = match state.proxies.endpoint_of(&proxy_name).await {
        Ok(e) => e,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    if rest == "/messages" && method == Method::POST {
        return handle_messages(&state, &proxy_name, &query, &body).await;
    }

    if rest == endpoint {
        return match method {
            Method::GET if accepts_sse(&headers) => {
                handle_sse_open(&state, &proxy_name, addr, &headers).await
            }
            Method::POST => handle_inline_post(&state, &proxy_name, &body).await,
            _ => StatusCode::BAD_REQUEST.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

/// GET `{proxy}{endpoint}` — opens an EVENT session; the first frame is a legacy-SSE
/// `endpoint` event pointing the client at its POST-back URL (§4.7).
async fn handle_sse_open(
    state: &Arc<GatewayState>,
    proxy_name: &str,
    addr: SocketAddr,
    headers: &HeaderMap,
) -> Response {
    let client_addr = addr.ip().to_string();
    if let Err(e) = state.rate_limiter.admit(&state.sessions, &client_addr, proxy_name).await {
        warn!(proxy = proxy_name, client = client_addr.as_str(), "session admission rejected: {e}");
        return e.http_status().into_response();
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (session, mut queue_rx) = state.sessions.create(proxy_name, &client_addr, user_agent).await;
    tokio::spawn(crate::heartbeat::run(session.clone(), state.sessions.clone()));

    let endpoint_url = format!("/{proxy_name}/messages?sessionId={}", session.id);
    info!(proxy = proxy_name, session = session.id.as_str(), "event session opened");

    let cancel = session.cancel.clone();
    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint_url));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                value = queue_rx.recv() => {
                    match value {
                        Some(value) => yield Ok(Event::default().data(value.to_string())),
                        None => break,
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// POST `{proxy}{endpoint}` — a single HTTP-transport call, answered synchronously.
async fn handle_inline_post(state: &Arc<GatewayState>, proxy_name: &str, body: &[u8]) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::failure(None, -32700, format!("malformed request: {e}"))),
            )
                .into_response();
        }
    };

    if request.is_notification() {
        state.proxies.dispatch_notification(proxy_name, request).await;
        return StatusCode::ACCEPTED.into_response();
    }

    match state.proxies.try_dispatch(proxy_name, &request).await {
        Ok(result) => (StatusCode::OK, Json(JsonRpcResponse::success(request.id, result))).into_response(),
        Err(e) => {
            let status = e.http_status();
            let code = e.json_rpc_code();
            (status, Json(JsonRpcResponse::failure(request.id, code, e.to_string()))).into_response()
        }
    }
}

/// POST `{proxy}/messages?sessionId=…` — dispatches into an already-open EVENT
/// session; the JSON-RPC response is delivered asynchronously over that session's
/// SSE stream, so this handler only ever acknowledges with 202 (§4.7, §6).
async fn handle_messages(
    state: &Arc<GatewayState>,
    proxy_name: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Response {
    let Some(session_id) = query.get("sessionId") else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let session = match state.sessions.get(session_id).await {
        Ok(s) if s.proxy_name == proxy_name => s,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };

    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    session.touch();

    if request.is_notification() {
        state.proxies.dispatch_notification(proxy_name, request).await;
        return StatusCode::ACCEPTED.into_response();
    }

    let is_initialize = request.method == "initialize";
    let response = state.proxies.dispatch(proxy_name, request).await;
    if is_initialize && response.error.is_none() {
        session.mark_initialized();
    }

    match session.enqueue(serde_json::to_value(&response).expect("JsonRpcResponse always serializes")) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(session = session_id.as_str(), "failed to enqueue response: {e}");
            state.sessions.remove(session_id).await;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
