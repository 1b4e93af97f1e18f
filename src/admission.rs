//! Rate Limit & Admission (C8): per-client-IP and per-proxy session caps, with a
//! bounded violation log. Grounded on the teacher's `stats.rs` trim-on-push idiom
//! (`ServerStats::push_call` draining down to `MAX_RECENT_CALLS`) applied here to a
//! `VecDeque` of violations, and on `error.rs`'s variant-per-failure-kind style.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{GatewayError, Result};
use crate::session::SessionManager;

const MAX_VIOLATIONS: usize = 2048;
const VIOLATION_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub timestamp: u64,
    pub client_addr: String,
    pub proxy_name: String,
    pub kind: String,
    pub severity: Severity,
}

pub struct AdmissionConfig {
    pub max_sessions_per_client: usize,
    pub max_sessions_per_proxy: usize,
    pub creation_window_seconds: u64,
    pub burst_allowance: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_client: 10,
            max_sessions_per_proxy: 50,
            creation_window_seconds: 60,
            burst_allowance: 3,
        }
    }
}

struct ClientWindow {
    creation_times: VecDeque<u64>,
}

pub struct RateLimiter {
    config: AdmissionConfig,
    client_windows: Mutex<HashMap<String, ClientWindow>>,
    violations: Mutex<VecDeque<Violation>>,
}

impl RateLimiter {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            client_windows: Mutex::new(HashMap::new()),
            violations: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate whether a new session may be created; records a violation and
    /// returns `AdmissionRejected` if any of the §4.8 thresholds is exceeded.
    pub async fn admit(&self, sessions: &SessionManager, client_addr: &str, proxy_name: &str) -> Result<()> {
        let per_client = sessions.count_for_client(client_addr).await;
        if per_client >= self.config.max_sessions_per_client {
            self.reject(client_addr, proxy_name, "max_sessions_per_client", Severity::Medium);
            return Err(GatewayError::AdmissionRejected(format!(
                "client {client_addr} at session cap ({per_client}/{})",
                self.config.max_sessions_per_client
            )));
        }

        let per_proxy = sessions.count_for_proxy(proxy_name).await;
        if per_proxy >= self.config.max_sessions_per_proxy {
            self.reject(client_addr, proxy_name, "max_sessions_per_proxy", Severity::Medium);
            return Err(GatewayError::AdmissionRejected(format!(
                "proxy {proxy_name} at session cap ({per_proxy}/{})",
                self.config.max_sessions_per_proxy
            )));
        }

        if let Some(over_by) = self.record_and_check_burst(client_addr) {
            let severity = severity_for_overage(over_by);
            self.reject(client_addr, proxy_name, "creation_burst", severity);
            return Err(GatewayError::RateLimited(format!(
                "client {client_addr} exceeded burst allowance by {over_by}"
            )));
        }

        Ok(())
    }

    /// Records this creation attempt in the client's rolling window and returns
    /// `Some(overage)` if the window now exceeds `max + burstAllowance`.
    fn record_and_check_burst(&self, client_addr: &str) -> Option<usize> {
        let now = unix_now();
        let window_start = now.saturating_sub(self.config.creation_window_seconds);
        let limit = self.config.max_sessions_per_client + self.config.burst_allowance;

        let mut windows = self.client_windows.lock().expect("client_windows lock");
        let entry = windows
            .entry(client_addr.to_string())
            .or_insert_with(|| ClientWindow { creation_times: VecDeque::new() });

        while entry.creation_times.front().is_some_and(|t| *t < window_start) {
            entry.creation_times.pop_front();
        }
        entry.creation_times.push_back(now);

        if entry.creation_times.len() > limit {
            Some(entry.creation_times.len() - limit)
        } else {
            None
        }
    }

    fn reject(&self, client_addr: &str, proxy_name: &str, kind: &str, severity: Severity) {
        let mut violations = self.violations.lock().expect("violations lock");
        let now = unix_now();
        while violations.front().is_some_and(|v| now.saturating_sub(v.timestamp) > VIOLATION_RETENTION.as_secs()) {
            violations.pop_front();
        }
        if violations.len() >= MAX_VIOLATIONS {
            violations.pop_front();
        }
        violations.push_back(Violation {
            timestamp: now,
            client_addr: client_addr.to_string(),
            proxy_name: proxy_name.to_string(),
            kind: kind.to_string(),
            severity,
        });
    }

    pub fn recent_violations(&self) -> Vec<Violation> {
        self.violations.lock().expect("violations lock").iter().cloned().collect()
    }
}

fn severity_for_overage(over_by: usize) -> Severity {
    match over_by {
        0 => Severity::Low,
        1..=2 => Severity::Medium,
        3..=5 => Severity::High,
        _ => Severity::Critical,
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
    async fn admits_under_all_thresholds() {
        let sessions = SessionManager::new();
        let limiter = RateLimiter::new(AdmissionConfig::default());
        assert!(limiter.admit(&sessions, "1.2.3.4", "proxy-a").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_per_client_cap() {
        let sessions = SessionManager::new();
        let config = AdmissionConfig { max_sessions_per_client: 1, ..Default::default() };
        let limiter = RateLimiter::new(config);
        let (_session, _rx) = sessions.create("proxy-a", "1.2.3.4", None).await;
        let err = limiter.admit(&sessions, "1.2.3.4", "proxy-a").await.unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionRejected(_)));
    }

    #[tokio::test]
    async fn burst_beyond_allowance_is_rate_limited() {
        let sessions = SessionManager::new();
        let config = AdmissionConfig {
            max_sessions_per_client: 1,
            burst_allowance: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        for _ in 0..2 {
            limiter.admit(&sessions, "1.2.3.4", "proxy-a").await.unwrap();
        }
        let err = limiter.admit(&sessions, "1.2.3.4", "proxy-a").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
    }

    #[test]
    fn violation_log_retains_recent_entries() {
        let limiter = RateLimiter::new(AdmissionConfig::default());
        limiter.reject("1.2.3.4", "proxy-a", "test", Severity::Low);
        assert_eq!(limiter.recent_violations().len(), 1);
    }
}
