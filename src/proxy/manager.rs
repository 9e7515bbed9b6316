use anyhow::{Context, Result};
use rand::thread_rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::cli::config::ProxySettings;
use crate::proxy::source::ProxyDescriptor;

/// Kind of work a session performs; each kind has its own sharing cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    ReadOnly,
    Authenticated,
    Transactional,
}

/// A logical session pinned to one proxy until rotation
#[derive(Debug, Clone)]
pub struct StickySession {
    pub session_id: String,
    pub proxy_id: String,
    pub session_type: SessionType,
    pub assigned_at: Instant,
    pub current_observed_ip: Option<String>,
    pub should_rotate: bool,
    pub rotation_deadline: Instant,
}

#[derive(Default)]
struct PoolState {
    proxies: Vec<ProxyDescriptor>,
    sessions: HashMap<String, StickySession>,
}

impl PoolState {
    fn proxy_mut(&mut self, proxy_id: &str) -> Option<&mut ProxyDescriptor> {
        self.proxies.iter_mut().find(|p| p.id == proxy_id)
    }

    fn unbind(&mut self, session_id: &str) -> Option<StickySession> {
        let session = self.sessions.remove(session_id)?;
        if let Some(proxy) = self.proxy_mut(&session.proxy_id) {
            proxy.active_connections = proxy.active_connections.saturating_sub(1);
        }
        Some(session)
    }

    /// Restore proxies whose recovery deadline passed, unless they failed too often
    fn recover_due(&mut self, now: Instant, failure_threshold: u32) {
        for proxy in self.proxies.iter_mut() {
            match proxy.recover_at {
                Some(at) if at <= now => {
                    proxy.recover_at = None;
                    if proxy.failure_count < failure_threshold {
                        proxy.is_healthy = true;
                        info!("Proxy {} restored to the healthy pool", proxy.id);
                    } else {
                        warn!(
                            "Proxy {} stays unhealthy after {} failures",
                            proxy.id, proxy.failure_count
                        );
                    }
                }
                _ => {}
            }
        }

        let exhausted = self
            .proxies
            .iter()
            .all(|p| !p.is_healthy && p.recover_at.is_none());
        if exhausted && !self.proxies.is_empty() {
            warn!("No usable proxies left, resetting pool health");
            for proxy in self.proxies.iter_mut() {
                proxy.is_healthy = true;
                proxy.failure_count = 0;
            }
        }
    }
}

/// Owns the proxy pool and the sticky session bindings.
///
/// Constructed once and shared by handle; nothing else mutates the pool.
pub struct ProxySessionManager {
    settings: ProxySettings,
    state: Arc<Mutex<PoolState>>,
}

/// Counts one unit of in-flight work on a proxy until dropped
pub struct TaskGuard {
    state: Arc<Mutex<PoolState>>,
    proxy_id: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(proxy) = state.proxy_mut(&self.proxy_id) {
            proxy.in_flight = proxy.in_flight.saturating_sub(1);
        }
    }
}

impl ProxySessionManager {
    /// Create a manager over the given pool; an empty pool means direct connections
    pub fn new(settings: ProxySettings, proxies: Vec<ProxyDescriptor>) -> Self {
        let proxies = if proxies.is_empty() {
            info!("No proxies configured, using direct connections");
            vec![ProxyDescriptor::direct()]
        } else {
            info!("Proxy pool initialized with {} proxies", proxies.len());
            proxies
        };

        Self {
            settings,
            state: Arc::new(Mutex::new(PoolState {
                proxies,
                sessions: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session_cap(&self, session_type: SessionType) -> u32 {
        let limits = &self.settings.limits;
        match session_type {
            SessionType::ReadOnly => limits.read_only,
            SessionType::Authenticated => limits.authenticated,
            SessionType::Transactional => limits.transactional,
        }
    }

    /// Get the proxy bound to `session_id`, binding a new one if needed.
    ///
    /// Waits while every healthy proxy is at its cap for `session_type`.
    pub async fn get_sticky_proxy(&self, session_id: &str, session_type: SessionType) -> ProxyDescriptor {
        self.acquire(session_id, session_type, None).await
    }

    async fn acquire(&self, session_id: &str, session_type: SessionType, avoid: Option<String>) -> ProxyDescriptor {
        let mut avoid = avoid;
        let mut saturated_logged = false;

        loop {
            match self.try_bind(session_id, session_type, &mut avoid) {
                Some(proxy) => return proxy,
                None if !saturated_logged => {
                    debug!(
                        "Proxy pool saturated for {:?} session {}, waiting",
                        session_type, session_id
                    );
                    saturated_logged = true;
                }
                None => {}
            }
            sleep(Duration::from_millis(self.settings.saturation_retry_ms)).await;
        }
    }

    fn try_bind(
        &self,
        session_id: &str,
        session_type: SessionType,
        avoid: &mut Option<String>,
    ) -> Option<ProxyDescriptor> {
        let now = Instant::now();
        let cap = self.session_cap(session_type);
        let mut state = self.lock();
        state.recover_due(now, self.settings.failure_threshold);

        if let Some(session) = state.sessions.get_mut(session_id) {
            if now >= session.rotation_deadline {
                session.should_rotate = true;
            }
            let reusable = !session.should_rotate;
            let proxy_id = session.proxy_id.clone();

            if let Some(proxy) = state.proxy_mut(&proxy_id) {
                if reusable && proxy.is_healthy {
                    proxy.last_used = Some(now);
                    return Some(proxy.clone());
                }
            }

            debug!("Session {} leaves proxy {}", session_id, proxy_id);
            state.unbind(session_id);
            *avoid = Some(proxy_id);
        }

        // Prefer a different exit than the one being left, but accept it if nothing else fits
        let eligible = |p: &ProxyDescriptor| p.is_healthy && p.active_connections < cap;
        let index = state
            .proxies
            .iter()
            .position(|p| eligible(p) && avoid.as_deref() != Some(p.id.as_str()))
            .or_else(|| state.proxies.iter().position(|p| eligible(p)))?;

        let proxy = &mut state.proxies[index];
        proxy.active_connections += 1;
        proxy.last_used = Some(now);
        let proxy = proxy.clone();

        let delay = self.settings.rotation.rotation_delay(&mut thread_rng());
        state.sessions.insert(
            session_id.to_string(),
            StickySession {
                session_id: session_id.to_string(),
                proxy_id: proxy.id.clone(),
                session_type,
                assigned_at: now,
                current_observed_ip: None,
                should_rotate: false,
                rotation_deadline: now + delay,
            },
        );

        debug!(
            "Bound session {} to proxy {} (rotates in {}s)",
            session_id,
            proxy.id,
            delay.as_secs()
        );

        Some(proxy)
    }

    /// Drop the binding for `session_id` and free its slot on the proxy
    pub fn release_sticky_proxy(&self, session_id: &str) {
        if let Some(session) = self.lock().unbind(session_id) {
            debug!("Released session {} from proxy {}", session_id, session.proxy_id);
        }
    }

    /// Take a proxy out of rotation until its recovery deadline
    pub fn mark_unhealthy(&self, proxy_id: &str, reason: &str) {
        let recovery = Duration::from_secs(self.settings.recovery_delay_secs);
        let mut state = self.lock();

        if let Some(proxy) = state.proxy_mut(proxy_id) {
            proxy.is_healthy = false;
            proxy.failure_count += 1;
            proxy.recover_at = Some(Instant::now() + recovery);
            warn!(
                "Proxy {} marked unhealthy ({} failures): {}",
                proxy_id, proxy.failure_count, reason
            );
        }
    }

    /// Clear the failure streak after a successful fetch
    pub fn record_success(&self, proxy_id: &str) {
        if let Some(proxy) = self.lock().proxy_mut(proxy_id) {
            proxy.failure_count = 0;
        }
    }

    /// Whether the session's rotation deadline has passed
    pub fn should_rotate_session(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();

        match state.sessions.get_mut(session_id) {
            Some(session) => {
                if now >= session.rotation_deadline {
                    session.should_rotate = true;
                }
                session.should_rotate
            }
            None => false,
        }
    }

    /// Mark a unit of work on the session's proxy as in flight
    pub fn track_task(&self, session_id: &str) -> Option<TaskGuard> {
        let mut state = self.lock();
        let proxy_id = state.sessions.get(session_id)?.proxy_id.clone();
        let proxy = state.proxy_mut(&proxy_id)?;
        proxy.in_flight += 1;

        Some(TaskGuard {
            state: self.state.clone(),
            proxy_id,
        })
    }

    fn in_flight(&self, session_id: &str) -> u32 {
        let mut state = self.lock();
        let Some(proxy_id) = state.sessions.get(session_id).map(|s| s.proxy_id.clone()) else {
            return 0;
        };
        state.proxy_mut(&proxy_id).map_or(0, |p| p.in_flight)
    }

    /// Move a session to a fresh proxy once its in-flight work has drained
    pub async fn perform_graceful_handoff(&self, session_id: &str, session_type: SessionType) -> ProxyDescriptor {
        let deadline = Instant::now() + Duration::from_secs(self.settings.handoff_timeout_secs);
        let poll = Duration::from_millis(self.settings.handoff_poll_ms);

        loop {
            let pending = self.in_flight(session_id);
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Handoff for session {} proceeding with {} tasks still in flight",
                    session_id, pending
                );
                break;
            }
            sleep(poll).await;
        }

        let previous = self.lock().unbind(session_id).map(|s| s.proxy_id);
        let proxy = self.acquire(session_id, session_type, previous.clone()).await;

        info!(
            "Session {} handed off from {} to {}",
            session_id,
            previous.as_deref().unwrap_or("none"),
            proxy.id
        );

        proxy
    }

    pub fn record_observed_ip(&self, session_id: &str, ip: &str) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.current_observed_ip = Some(ip.to_string());
        }
    }

    pub fn session(&self, session_id: &str) -> Option<StickySession> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Current state of every proxy
    pub fn snapshot(&self) -> Vec<ProxyDescriptor> {
        self.lock().proxies.clone()
    }

    /// Ask the IP echo endpoint which address the proxy exits from
    pub async fn verify_ip(&self, proxy: &ProxyDescriptor) -> Result<String> {
        let check_url = self
            .settings
            .ip_check_url
            .as_deref()
            .context("No IP check URL configured")?;

        let mut builder = Client::builder().timeout(Duration::from_secs(self.settings.ip_check_timeout_secs));
        if let Some(proxy_url) = proxy.url() {
            let reqwest_proxy = reqwest::Proxy::all(&proxy_url)
                .context(format!("Invalid proxy URL for {}", proxy.id))?;
            builder = builder.proxy(reqwest_proxy);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        let body = client
            .get(check_url)
            .send()
            .await
            .context(format!("IP check through proxy {} failed", proxy.id))?
            .error_for_status()?
            .text()
            .await
            .context("Failed to read IP check response")?;

        Ok(parse_ip_response(&body))
    }

    /// Verify every proxy in the pool, returning the exit IP or the failure
    pub async fn check_all(&self) -> Vec<(String, Result<String>)> {
        let mut results = Vec::new();

        for proxy in self.snapshot() {
            let outcome = self.verify_ip(&proxy).await;
            match &outcome {
                Ok(ip) => debug!("Proxy {} exits from {}", proxy.id, ip),
                Err(e) => warn!("Proxy check failed for {}: {:#}", proxy.id, e),
            }
            results.push((proxy.id.clone(), outcome));
        }

        results
    }
}

/// IP echo services answer either plain text or `{"ip": "..."}`
fn parse_ip_response(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("ip").and_then(|ip| ip.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
