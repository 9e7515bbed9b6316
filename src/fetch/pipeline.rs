use anyhow::Result;
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::ScraperSettings;
use crate::fetch::classifier::{classify, ErrorKind};
use crate::fetch::error::FetchError;
use crate::fetch::PageFetcher;
use crate::proxy::manager::{ProxySessionManager, SessionType};
use crate::proxy::source::ProxyDescriptor;
use crate::utils::metrics::MetricsCollector;

/// What one attempt needs to know
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub url: String,
    pub proxy: ProxyDescriptor,
    pub session_id: String,
    /// 1-based
    pub attempt: u32,
    /// The previous attempt failed at the proxy layer; start from a clean client
    pub force_recreate: bool,
}

/// One way of retrieving a page, driven by [`ResilientFetchPipeline`]
#[async_trait]
pub trait AttemptStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, ctx: &AttemptContext) -> Result<String>;

    /// Drop any client state bound to the current proxy
    async fn invalidate(&self) {}
}

/// Retry loop around an [`AttemptStrategy`].
///
/// Each fetch gets its own sticky session. Failures are classified:
/// fatal ones stop immediately, proxy-related ones penalize the proxy and
/// force a fresh client, everything else backs off and retries.
pub struct ResilientFetchPipeline {
    proxies: Arc<ProxySessionManager>,
    strategy: Arc<dyn AttemptStrategy>,
    settings: ScraperSettings,
    metrics: MetricsCollector,
}

impl ResilientFetchPipeline {
    pub fn new(
        proxies: Arc<ProxySessionManager>,
        strategy: Arc<dyn AttemptStrategy>,
        settings: ScraperSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            proxies,
            strategy,
            settings,
            metrics,
        }
    }

    /// `min(base * 2^(attempt-1), max)` plus up to `jitter_ms` of noise
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let backoff = &self.settings.backoff;
        let exp = backoff
            .base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            .min(backoff.max_ms);
        let jitter = if backoff.jitter_ms > 0 {
            thread_rng().gen_range(0..=backoff.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    /// Check the exit IP when the session lands on a new proxy
    async fn verify_exit(&self, session_id: &str, proxy: &ProxyDescriptor) {
        if proxy.is_direct() {
            return;
        }

        match self.proxies.verify_ip(proxy).await {
            Ok(ip) => {
                debug!("Session {} exits via {} as {}", session_id, proxy.id, ip);
                self.proxies.record_observed_ip(session_id, &ip);
            }
            Err(e) => warn!("Could not verify exit IP of {}: {:#}", proxy.id, e),
        }
    }

    async fn next_proxy(&self, session_id: &str, session_type: SessionType) -> ProxyDescriptor {
        if self.proxies.should_rotate_session(session_id) {
            info!("Session {} due for rotation", session_id);
            self.proxies.perform_graceful_handoff(session_id, session_type).await
        } else {
            self.proxies.get_sticky_proxy(session_id, session_type).await
        }
    }
}

#[async_trait]
impl PageFetcher for ResilientFetchPipeline {
    async fn fetch(&self, url: &str, session_type: SessionType) -> Result<String, FetchError> {
        let session_id = format!("fetch-{}", Uuid::new_v4());
        let max_attempts = self.settings.max_attempts.max(1);
        let mut force_recreate = false;
        let mut last_error = String::new();
        let mut previous_proxy: Option<String> = None;

        for attempt in 1..=max_attempts {
            let proxy = self.next_proxy(&session_id, session_type).await;

            if previous_proxy.as_deref() != Some(proxy.id.as_str()) {
                if self.settings.verify_proxy_ip {
                    self.verify_exit(&session_id, &proxy).await;
                }
                previous_proxy = Some(proxy.id.clone());
            }

            debug!(
                "Fetching {} via {} with {} (attempt {}/{})",
                url,
                proxy.id,
                self.strategy.name(),
                attempt,
                max_attempts
            );

            let ctx = AttemptContext {
                url: url.to_string(),
                proxy: proxy.clone(),
                session_id: session_id.clone(),
                attempt,
                force_recreate,
            };

            let timer = self.metrics.start_timer();
            let outcome = {
                let _in_flight = self.proxies.track_task(&session_id);
                self.strategy.attempt(&ctx).await
            };
            force_recreate = false;

            let error = match outcome {
                Ok(html) => {
                    self.metrics.record_attempt(url, None, timer.end(), html.len()).await;
                    self.proxies.record_success(&proxy.id);
                    self.proxies.release_sticky_proxy(&session_id);
                    info!("Fetched {} ({} bytes) on attempt {}", url, html.len(), attempt);
                    return Ok(html);
                }
                Err(error) => error,
            };

            let classification = classify(&error);
            self.metrics
                .record_attempt(url, Some(classification.kind), timer.end(), 0)
                .await;
            last_error = classification.message.clone();

            warn!(
                "Attempt {}/{} for {} failed ({:?}): {}",
                attempt, max_attempts, url, classification.kind, classification.message
            );

            match classification.kind {
                ErrorKind::Fatal => {
                    self.proxies.release_sticky_proxy(&session_id);
                    error!("Giving up on {}: {}", url, classification.message);
                    return Err(FetchError::Fatal {
                        url: url.to_string(),
                        attempt,
                        message: classification.message,
                    });
                }
                ErrorKind::ProxyRelated => {
                    if !proxy.is_direct() {
                        self.proxies.mark_unhealthy(&proxy.id, &classification.message);
                    }
                    self.strategy.invalidate().await;
                    force_recreate = true;
                }
                ErrorKind::Transient => {}
            }

            if attempt < max_attempts {
                let delay = self.backoff_delay(attempt);
                debug!("Retrying {} in {} ms", url, delay.as_millis());
                sleep(delay).await;
            }
        }

        self.proxies.release_sticky_proxy(&session_id);
        error!("Exhausted {} attempts for {}", max_attempts, url);

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{BackoffSettings, ProxySettings};
    use crate::proxy::source::parse_proxy_list;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes and records every context it sees
    struct ScriptedStrategy {
        outcomes: Mutex<VecDeque<Result<String>>>,
        seen: Mutex<Vec<AttemptContext>>,
        invalidations: Mutex<usize>,
    }

    impl ScriptedStrategy {
        fn new(outcomes: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
                invalidations: Mutex::new(0),
            })
        }

        fn seen(&self) -> Vec<AttemptContext> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttemptStrategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn attempt(&self, ctx: &AttemptContext) -> Result<String> {
            self.seen.lock().unwrap().push(ctx.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script ran out")))
        }

        async fn invalidate(&self) {
            *self.invalidations.lock().unwrap() += 1;
        }
    }

    fn pipeline(entries: &[&str], strategy: Arc<ScriptedStrategy>) -> (ResilientFetchPipeline, Arc<ProxySessionManager>) {
        let proxies = Arc::new(ProxySessionManager::new(
            ProxySettings {
                ip_check_url: None,
                ..ProxySettings::default()
            },
            parse_proxy_list(entries.iter().copied()),
        ));
        let settings = ScraperSettings {
            max_attempts: 3,
            backoff: BackoffSettings {
                base_ms: 1000,
                max_ms: 4000,
                jitter_ms: 100,
            },
            verify_proxy_ip: false,
            ..ScraperSettings::default()
        };

        (
            ResilientFetchPipeline::new(proxies.clone(), strategy, settings, MetricsCollector::new()),
            proxies,
        )
    }

    fn proxy_error() -> Result<String> {
        Err(FetchError::Proxy("net::ERR_PROXY_CONNECTION_FAILED".to_string()).into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_proxy_failures() {
        let strategy = ScriptedStrategy::new(vec![proxy_error(), proxy_error(), proxy_error()]);
        let (pipeline, proxies) = pipeline(&["p1:8000", "p2:8000", "p3:8000"], strategy.clone());
        let url = "https://classifieds.example/s-bikes";

        let err = pipeline.fetch(url, SessionType::ReadOnly).await.unwrap_err();

        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        let message = err.to_string();
        assert!(message.contains(url), "{}", message);
        assert!(message.contains("3 attempts"), "{}", message);

        assert!(proxies.snapshot().iter().any(|p| !p.is_healthy));

        let seen = strategy.seen();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].force_recreate);
        assert!(seen[1].force_recreate && seen[2].force_recreate);
        assert_ne!(seen[0].proxy.id, seen[1].proxy.id);
        assert_eq!(*strategy.invalidations.lock().unwrap(), 3);

        // Session released on the way out
        assert!(proxies.session(&seen[0].session_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_short_circuit() {
        let strategy = ScriptedStrategy::new(vec![
            Err(FetchError::Http {
                status: 403,
                message: "Forbidden".to_string(),
            }
            .into()),
            Ok("<html>never reached</html>".to_string()),
        ]);
        let (pipeline, proxies) = pipeline(&["p1:8000"], strategy.clone());

        let err = pipeline.fetch("https://classifieds.example/", SessionType::ReadOnly).await.unwrap_err();

        assert!(matches!(err, FetchError::Fatal { attempt: 1, .. }));
        assert_eq!(strategy.seen().len(), 1);
        assert!(proxies.snapshot()[0].is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retry_keeps_proxy() {
        let strategy = ScriptedStrategy::new(vec![
            Err(anyhow::anyhow!("HTTP 429: too many requests")),
            Ok("<html>listings</html>".to_string()),
        ]);
        let (pipeline, proxies) = pipeline(&["p1:8000", "p2:8000"], strategy.clone());

        let started = tokio::time::Instant::now();
        let html = pipeline.fetch("https://classifieds.example/", SessionType::ReadOnly).await.unwrap();

        assert_eq!(html, "<html>listings</html>");
        let seen = strategy.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].proxy.id, seen[1].proxy.id);
        assert_eq!(seen[0].session_id, seen[1].session_id);
        assert!(!seen[1].force_recreate);
        assert!(proxies.snapshot().iter().all(|p| p.is_healthy && p.active_connections == 0));

        // First backoff is base plus jitter
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1000) && waited <= Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_pool_never_penalized() {
        let strategy = ScriptedStrategy::new(vec![proxy_error(), Ok("ok".to_string())]);
        let (pipeline, proxies) = pipeline(&[], strategy.clone());

        pipeline.fetch("https://classifieds.example/", SessionType::ReadOnly).await.unwrap();

        let pool = proxies.snapshot();
        assert!(pool[0].is_direct());
        assert!(pool[0].is_healthy);
        assert!(strategy.seen()[1].force_recreate);
    }

    #[test]
    fn test_backoff_is_capped() {
        let strategy = ScriptedStrategy::new(Vec::new());
        let (pipeline, _) = pipeline(&["p1:8000"], strategy);

        let first = pipeline.backoff_delay(1);
        let fifth = pipeline.backoff_delay(5);

        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1100));
        assert!(fifth >= Duration::from_millis(4000) && fifth <= Duration::from_millis(4100));
    }
}
