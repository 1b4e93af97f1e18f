//! Session Manager (C5): the set of open EVENT-transport client streams. Grounded
//! on the session-registry shape of the agentgateway `session.rs` example
//! (`RwLock<HashMap<String, Session>>`, uuid-keyed ids, `Drop`-based cleanup) and on
//! the teacher's `mcp/proxy.rs` broadcast-channel pattern for telling a stream
//! "something changed" without the stream owning a poll loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

pub const MAX_QUEUE: usize = 1024;
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const IDLE_TTL: Duration = Duration::from_secs(300);
pub const INIT_DEADLINE: Duration = Duration::from_secs(30);
pub const BACKEND_GRACE: Duration = Duration::from_secs(30);

const RTT_WINDOW: usize = 64;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
    pub last_rtt_ms: Option<u64>,
    rtt_samples: Vec<u64>,
}

impl SessionMetrics {
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.last_rtt_ms = Some(rtt_ms);
        self.rtt_samples.push(rtt_ms);
        if self.rtt_samples.len() > RTT_WINDOW {
            self.rtt_samples.remove(0);
        }
    }

    pub fn mean_rtt_ms(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<u64>() as f64 / self.rtt_samples.len() as f64)
    }
}

pub struct Session {
    pub id: String,
    pub proxy_name: String,
    pub client_addr: String,
    pub user_agent: Option<String>,
    pub created_at: u64,
    last_activity: AtomicU64,
    pub initialized: AtomicBool,
    pub metrics: Mutex<SessionMetrics>,
    pub adaptive_interval_ms: AtomicU64,
    queue_tx: mpsc::Sender<Value>,
    pub cancel: CancellationToken,
    backend_verified_since_grace: AtomicU64,
}

impl Session {
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    /// Enqueue an outbound message in FIFO order. Returns `QueueOverflow` if the
    /// session's slow-reading client has backed the queue up to `MAX_QUEUE`; the
    /// caller is expected to force-close the session on this error (§4.5).
    pub fn enqueue(&self, message: Value) -> Result<()> {
        self.queue_tx
            .try_send(message)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::QueueOverflow(MAX_QUEUE),
                mpsc::error::TrySendError::Closed(_) => GatewayError::PeerClosed,
            })
    }

    pub fn note_backend_left_verified(&self) {
        if self.backend_verified_since_grace.load(Ordering::Relaxed) == 0 {
            self.backend_verified_since_grace.store(unix_now(), Ordering::Relaxed);
        }
    }

    pub fn note_backend_verified(&self) {
        self.backend_verified_since_grace.store(0, Ordering::Relaxed);
    }

    fn backend_grace_expired(&self, now: u64) -> bool {
        let since = self.backend_verified_since_grace.load(Ordering::Relaxed);
        since != 0 && now.saturating_sub(since) > BACKEND_GRACE.as_secs()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and registers a new session, returning the session handle plus the
    /// receiving half of its pending queue for the dedicated writer task to drain.
    pub async fn create(
        &self,
        proxy_name: &str,
        client_addr: &str,
        user_agent: Option<String>,
    ) -> (Arc<Session>, mpsc::Receiver<Value>) {
        let (queue_tx, queue_rx) = mpsc::channel(MAX_QUEUE);
        let now = unix_now();
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            proxy_name: proxy_name.to_string(),
            client_addr: client_addr.to_string(),
            user_agent,
            created_at: now,
            last_activity: AtomicU64::new(now),
            initialized: AtomicBool::new(false),
            metrics: Mutex::new(SessionMetrics::default()),
            adaptive_interval_ms: AtomicU64::new(10_000),
            queue_tx,
            cancel: CancellationToken::new(),
            backend_verified_since_grace: AtomicU64::new(0),
        });

        self.sessions.write().await.insert(session.id.clone(), session.clone());
        info!(session = session.id.as_str(), proxy = proxy_name, "session opened");
        (session, queue_rx)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSession(id.to_string()))
    }

    pub async fn remove(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.remove(id) {
            session.cancel.cancel();
            info!(session = id, "session closed");
        }
    }

    pub async fn count_for_proxy(&self, proxy_name: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.proxy_name == proxy_name)
            .count()
    }

    pub async fn count_for_client(&self, client_addr: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.client_addr == client_addr)
            .count()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Close every idle, never-initialized, or backend-grace-expired session.
    /// Intended to run on a `REAP_INTERVAL` ticker (§4.5).
    pub async fn reap_idle(&self) {
        let now = unix_now();
        let mut to_remove = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let idle_for = now.saturating_sub(session.last_activity());
                let age = now.saturating_sub(session.created_at);
                let uninitialized_timeout =
                    !session.initialized.load(Ordering::Relaxed) && age > INIT_DEADLINE.as_secs();
                if idle_for > IDLE_TTL.as_secs() || uninitialized_timeout || session.backend_grace_expired(now) {
                    to_remove.push(id.clone());
                }
            }
        }
        for id in to_remove {
            warn!(session = id.as_str(), "reaping idle/stale session");
            self.remove(&id).await;
        }
    }

    /// Spawn the background idle-reap sweeper. Returns its `CancellationToken` so
    /// callers can stop it during graceful shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let manager = self.clone();
        let reaper_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = reaper_token.cancelled() => return,
                    _ = ticker.tick() => manager.reap_idle().await,
                }
            }
        });
        token
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
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

    #[tokio::test]
    async fn create_registers_session_lookup() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        let fetched = manager.get(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[tokio::test]
    async fn remove_makes_session_unknown() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        manager.remove(&session.id).await;
        assert!(matches!(manager.get(&session.id).await.unwrap_err(), GatewayError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn enqueue_past_capacity_overflows() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        for _ in 0..MAX_QUEUE {
            session.enqueue(serde_json::json!({})).unwrap();
        }
        let err = session.enqueue(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, GatewayError::QueueOverflow(_)));
    }

    #[tokio::test]
    async fn reap_idle_closes_uninitialized_past_deadline() {
        let manager = Arc::new(SessionManager::new());
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        session
            .last_activity
            .store(unix_now().saturating_sub(IDLE_TTL.as_secs() + 1), Ordering::Relaxed);
        manager.reap_idle().await;
        assert!(manager.get(&session.id).await.is_err());
    }

    #[test]
    fn rtt_window_caps_at_64_samples() {
        let mut metrics = SessionMetrics::default();
        for i in 0..100 {
            metrics.record_rtt(i);
        }
        assert_eq!(metrics.rtt_samples.len(), RTT_WINDOW);
    }
}
