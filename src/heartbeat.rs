//! Heartbeat Controller (C6): a per-session ticker that sends `notifications/ping`
//! and adapts its own interval from recent RTT/error history. Grounded on the
//! teacher's `stats.rs` bounded-sample idiom (`ServerStats::push_call` trims to
//! `MAX_RECENT_CALLS`), here reused for `SessionMetrics`'s sliding RTT window, and
//! on the teacher's per-session task-per-concern layout (one task, one session).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::session::{Session, SessionManager};

const MIN_INTERVAL_MS: u64 = 5_000;
const MAX_INTERVAL_MS: u64 = 30_000;
const EVAL_EVERY_N_TICKS: u32 = 6;
const ERROR_RATE_HIGH: f64 = 0.20;
const ERROR_RATE_LOW: f64 = 0.02;
const FAST_RTT_MS: f64 = 200.0;
const UNHEALTHY_CONSECUTIVE_FAILURES: u32 = 3;

/// Runs until the session's cancellation token fires or three consecutive
/// heartbeat sends fail, in which case the session is removed from `sessions`
/// so the reap and the SSE writer both observe it going away.
pub async fn run(session: Arc<Session>, sessions: Arc<SessionManager>) {
    let mut sent_since_eval = 0u32;
    let mut failed_since_eval = 0u32;
    let mut consecutive_failures = 0u32;

    loop {
        let interval_ms = session.adaptive_interval_ms.load(Ordering::Relaxed);
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
        }

        let started = Instant::now();
        let ping = json!({ "jsonrpc": "2.0", "method": "notifications/ping" });
        let send_result = session.enqueue(ping);
        sent_since_eval += 1;

        {
            let mut metrics = session.metrics.lock().await;
            metrics.heartbeats_sent += 1;
            match &send_result {
                Ok(()) => {
                    consecutive_failures = 0;
                    metrics.record_rtt(started.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    failed_since_eval += 1;
                    metrics.heartbeats_failed += 1;
                    warn!(session = session.id.as_str(), "heartbeat send failed: {e}");
                }
            }
        }

        if consecutive_failures >= UNHEALTHY_CONSECUTIVE_FAILURES {
            warn!(session = session.id.as_str(), "session unhealthy after {consecutive_failures} consecutive heartbeat failures");
            sessions.remove(&session.id).await;
            return;
        }

        if sent_since_eval >= EVAL_EVERY_N_TICKS {
            adapt_interval(&session, sent_since_eval, failed_since_eval).await;
            sent_since_eval = 0;
            failed_since_eval = 0;
        }
    }
}

async fn adapt_interval(session: &Session, sent: u32, failed: u32) {
    let error_rate = failed as f64 / sent as f64;
    let mean_rtt = session.metrics.lock().await.mean_rtt_ms();

    let current = session.adaptive_interval_ms.load(Ordering::Relaxed);
    let next = if error_rate > ERROR_RATE_HIGH {
        ((current as f64 * 1.5) as u64).min(MAX_INTERVAL_MS)
    } else if error_rate < ERROR_RATE_LOW && mean_rtt.map(|r| r < FAST_RTT_MS).unwrap_or(false) {
        ((current as f64 * 0.8) as u64).max(MIN_INTERVAL_MS)
    } else {
        current
    };

    if next != current {
        debug!(session = session.id.as_str(), from = current, to = next, "adapted heartbeat interval");
        session.adaptive_interval_ms.store(next, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;

    #[tokio::test]
    async fn three_consecutive_failures_cancel_session() {
        let manager = Arc::new(SessionManager::new());
        let (session, rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        drop(rx); // closing the receiver makes every enqueue fail

        let handle = tokio::spawn(run(session.clone(), manager.clone()));
        let cancelled = tokio::time::timeout(Duration::from_secs(2), session.cancel.cancelled()).await;
        assert!(cancelled.is_ok());
        handle.await.unwrap();
        assert!(manager.get(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn adapt_interval_backs_off_on_high_error_rate() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        session.adaptive_interval_ms.store(10_000, Ordering::Relaxed);
        adapt_interval(&session, 6, 4).await;
        assert!(session.adaptive_interval_ms.load(Ordering::Relaxed) > 10_000);
    }

    #[tokio::test]
    async fn adapt_interval_speeds_up_on_fast_clean_traffic() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create("proxy-a", "127.0.0.1", None).await;
        session.adaptive_interval_ms.store(10_000, Ordering::Relaxed);
        {
            let mut metrics = session.metrics.lock().await;
            for _ in 0..10 {
                metrics.record_rtt(50);
            }
        }
        adapt_interval(&session, 6, 0).await;
        assert!(session.adaptive_interval_ms.load(Ordering::Relaxed) < 10_000);
    }
}
