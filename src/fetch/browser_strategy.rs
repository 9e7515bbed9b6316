use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::{select_ok, FutureExt};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::artifacts::{ArtifactStore, SessionArtifacts};
use crate::browser::behavior::BehaviorSimulator;
use crate::browser::captcha::{detect_captcha, injection_script, CaptchaSolver};
use crate::browser::challenge::ChallengeDetector;
use crate::browser::session::{BrowserDriver, BrowserHandle, WaitCondition};
use crate::cli::config::{ChallengeSettings, ScraperSettings};
use crate::fetch::error::FetchError;
use crate::fetch::pipeline::{AttemptContext, AttemptStrategy};

/// How a detected challenge looked, so observers can tell when it changes
struct Gate {
    url: String,
    title: String,
    /// Detected through HTML markers rather than only the title
    marked: bool,
}

/// Drives the shared automated browser through one fetch attempt:
/// navigation, stealth patches, challenge handling and artifact reuse.
pub struct BrowserStrategy {
    browser: BrowserHandle,
    detector: ChallengeDetector,
    behavior: BehaviorSimulator,
    captcha: Option<CaptchaSolver>,
    artifacts: Option<ArtifactStore>,
    challenge: ChallengeSettings,
    navigation_timeout: Duration,
    lenient_timeout: Duration,
}

impl BrowserStrategy {
    pub fn new(
        browser: BrowserHandle,
        detector: ChallengeDetector,
        behavior: BehaviorSimulator,
        scraper: &ScraperSettings,
        challenge: ChallengeSettings,
    ) -> Self {
        Self {
            browser,
            detector,
            behavior,
            captcha: None,
            artifacts: None,
            challenge,
            navigation_timeout: Duration::from_secs(scraper.navigation_timeout_secs),
            lenient_timeout: Duration::from_secs(scraper.lenient_navigation_timeout_secs),
        }
    }

    pub fn with_captcha_solver(mut self, solver: Option<CaptchaSolver>) -> Self {
        self.captcha = solver;
        self
    }

    pub fn with_artifact_store(mut self, store: Option<ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.challenge.poll_interval_ms.max(1))
    }

    /// Full load first, then one retry that only waits for the DOM
    async fn navigate(&self, driver: &mut dyn BrowserDriver, url: &str) -> Result<()> {
        match driver.navigate(url, WaitCondition::Load, self.navigation_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Navigation to {} failed ({:#}), retrying with lenient wait", url, e);
                driver
                    .navigate(url, WaitCondition::DomReady, self.lenient_timeout)
                    .await
                    .context(format!("Lenient navigation to {} failed", url))
            }
        }
    }

    /// Confirm with the full check that the current page is no longer a gate
    async fn cleared(&self, driver: &dyn BrowserDriver, title: Option<String>, html: Option<String>) -> bool {
        let title = match title {
            Some(title) => title,
            None => driver.title().await.unwrap_or_default(),
        };
        let html = match html {
            Some(html) => html,
            None => driver.source().await.unwrap_or_default(),
        };
        !self.detector.is_challenge(&title, &html)
    }

    /// Resolves once the title moves away from the gate's title and the
    /// page no longer looks like a challenge
    async fn title_observer(&self, driver: &dyn BrowserDriver, gate: &Gate) -> Result<&'static str, FetchError> {
        let deadline = Instant::now() + Duration::from_secs(self.challenge.title_timeout_secs);

        loop {
            if let Ok(title) = driver.title().await {
                if title != gate.title && self.cleared(driver, Some(title), None).await {
                    return Ok("title");
                }
            }
            if Instant::now() >= deadline {
                return Err(FetchError::Timeout("challenge title did not change".to_string()));
            }
            sleep(self.poll_interval()).await;
        }
    }

    /// Resolves once the browser lands on a different URL, or the gate's
    /// markers disappear, and the page no longer looks like a challenge
    async fn navigation_observer(&self, driver: &dyn BrowserDriver, gate: &Gate) -> Result<&'static str, FetchError> {
        let deadline = Instant::now() + Duration::from_secs(self.challenge.navigation_timeout_secs);

        loop {
            let moved = matches!(driver.current_url().await, Ok(current) if current != gate.url);
            let html = driver.source().await.ok();
            let unmarked = gate.marked
                && html
                    .as_deref()
                    .is_some_and(|html| !self.detector.has_challenge_markers(html));

            if (moved || unmarked) && self.cleared(driver, None, html).await {
                return Ok("navigation");
            }
            if Instant::now() >= deadline {
                return Err(FetchError::Timeout("no navigation away from challenge".to_string()));
            }
            sleep(self.poll_interval()).await;
        }
    }

    /// Wait for whichever observer sees the challenge clear first
    async fn wait_for_clearance(&self, driver: &dyn BrowserDriver, gate: &Gate) -> bool {
        let observers = vec![
            self.title_observer(driver, gate).boxed(),
            self.navigation_observer(driver, gate).boxed(),
        ];

        match select_ok(observers).await {
            Ok((observer, _)) => {
                debug!("Challenge cleared ({} observer)", observer);
                true
            }
            Err(e) => {
                debug!("Challenge observers gave up: {}", e);
                false
            }
        }
    }

    /// Returns whether a CAPTCHA solve was attempted
    async fn handle_challenge(&self, driver: &dyn BrowserDriver, url: &str) -> Result<bool> {
        let title = driver.title().await?;
        let html = driver.source().await?;

        if !self.detector.is_challenge(&title, &html) {
            return Ok(false);
        }

        info!("Challenge detected at {} ({})", url, title);

        let gate = Gate {
            url: driver.current_url().await.unwrap_or_else(|_| url.to_string()),
            marked: self.detector.has_challenge_markers(&html),
            title,
        };

        if self.wait_for_clearance(driver, &gate).await {
            return Ok(false);
        }

        let html = driver.source().await.unwrap_or(html);
        let solver = self.captcha.as_ref().filter(|_| self.detector.has_captcha(&html));

        match solver {
            Some(solver) => {
                let page_url = driver.current_url().await.unwrap_or_else(|_| url.to_string());
                match detect_captcha(&html, &page_url) {
                    Ok(Some(challenge)) => match solver.solve(&challenge).await {
                        Ok(token) => {
                            driver.execute(&injection_script(challenge.kind, &token)).await?;
                            if !self.wait_for_clearance(driver, &gate).await {
                                warn!("Challenge still present after submitting captcha token");
                            }
                        }
                        Err(e) => warn!("Captcha solving failed: {}", e),
                    },
                    Ok(None) => warn!("Captcha marker present but no widget recognized"),
                    Err(e) => warn!("Cannot solve captcha: {}", e),
                }
                Ok(true)
            }
            None => {
                let grace = Duration::from_secs(self.challenge.grace_period_secs);
                warn!(
                    "Challenge at {} unresolved, waiting {}s grace period",
                    url,
                    grace.as_secs()
                );
                sleep(grace).await;
                Ok(false)
            }
        }
    }

    async fn restore_artifacts(&self, driver: &mut dyn BrowserDriver, host: &str, url: &str) -> Result<()> {
        let Some(store) = &self.artifacts else {
            return Ok(());
        };

        match store.load(host).await? {
            Some(saved) if !saved.is_empty() => {
                saved.restore(driver).await?;
                // Reload so the restored state is sent with the request
                self.navigate(driver, url).await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn save_artifacts(&self, driver: &dyn BrowserDriver, host: &str) {
        let Some(store) = &self.artifacts else {
            return;
        };

        let saved = match SessionArtifacts::capture(driver, host).await {
            Ok(artifacts) => store.save(&artifacts).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!("Failed to persist session artifacts for {}: {:#}", host, e);
        }
    }
}

#[async_trait]
impl AttemptStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn attempt(&self, ctx: &AttemptContext) -> Result<String> {
        let host = url::Url::parse(&ctx.url)
            .context(format!("Invalid URL: {}", ctx.url))?
            .host_str()
            .unwrap_or_default()
            .to_string();

        let mut guard = self.browser.acquire(&ctx.proxy, ctx.force_recreate).await?;
        let active = &mut *guard;
        let first_visit = active.first_visit(&host);
        let stealth = active.fingerprint.stealth_script();
        let driver = active.driver.as_mut();

        self.navigate(driver, &ctx.url).await?;

        if first_visit {
            if let Err(e) = self.restore_artifacts(driver, &host, &ctx.url).await {
                warn!("Could not restore session artifacts for {}: {:#}", host, e);
            }
        }

        if let Err(e) = driver.execute(&stealth).await {
            debug!("Stealth script failed: {:#}", e);
        }

        let captcha_attempted = self.handle_challenge(driver, &ctx.url).await?;

        if let Err(e) = self.behavior.simulate_presence(driver).await {
            debug!("Presence simulation interrupted: {:#}", e);
        }

        let html = driver.source().await?;
        let title = driver.title().await.unwrap_or_default();

        if self.detector.is_challenge(&title, &html) {
            if !self.detector.is_substantial(&html) {
                let detail = format!("{} ({} bytes)", ctx.url, html.len());
                return Err(if captcha_attempted {
                    FetchError::CaptchaUnresolved(detail).into()
                } else {
                    FetchError::Challenge(detail).into()
                });
            }
            warn!("Challenge markers remain at {} but content looks real, continuing", ctx.url);
        }

        self.save_artifacts(driver, &host).await;

        Ok(html)
    }

    async fn invalidate(&self) {
        self.browser.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fingerprint::FingerprintManager;
    use crate::browser::session::testing::{FakeLauncher, FakePage};
    use crate::cli::config::{BrowserBehavior, BrowserSettings};
    use crate::cli::config::{CaptchaSettings, ProxySettings};
    use crate::fetch::classifier::{classify, ErrorKind};
    use crate::fetch::pipeline::ResilientFetchPipeline;
    use crate::fetch::PageFetcher;
    use crate::proxy::manager::{ProxySessionManager, SessionType};
    use crate::proxy::source::ProxyDescriptor;
    use crate::utils::metrics::MetricsCollector;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn real_page() -> FakePage {
        FakePage {
            title: "Road bikes | Classifieds".to_string(),
            html: format!("<html><body>{}</body></html>", "<article class=\"aditem\"></article>".repeat(10)),
            ..FakePage::default()
        }
    }

    fn gate(next: Option<FakePage>) -> FakePage {
        FakePage {
            title: "Just a moment...".to_string(),
            html: "<html><div id=\"cf-challenge-running\"></div></html>".to_string(),
            next: next.map(Box::new),
            ..FakePage::default()
        }
    }

    fn strategy(launcher: &FakeLauncher, artifacts: Option<ArtifactStore>) -> BrowserStrategy {
        let handle = BrowserHandle::new(
            Arc::new(launcher.clone()),
            FingerprintManager::new(BrowserSettings::default().fingerprints),
        );
        let challenge = ChallengeSettings {
            min_content_length: 200,
            ..ChallengeSettings::default()
        };

        BrowserStrategy::new(
            handle,
            ChallengeDetector::new(&challenge),
            BehaviorSimulator::new(BrowserBehavior {
                enabled: false,
                ..BrowserBehavior::default()
            }),
            &ScraperSettings::default(),
            challenge,
        )
        .with_artifact_store(artifacts)
    }

    /// Normal title, gated only by markers, with a Turnstile widget
    fn turnstile_gate(solved: Option<FakePage>) -> FakePage {
        FakePage {
            title: "Classifieds".to_string(),
            html: r#"<html><div id="cf-challenge-running"></div><div class="cf-turnstile" data-sitekey="0x4AAA"></div></html>"#
                .to_string(),
            on_script: solved.map(|page| ("cf-turnstile-response".to_string(), Box::new(page))),
            ..FakePage::default()
        }
    }

    async fn captcha_service() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/in.php"))
            .and(query_param("method", "turnstile"))
            .and(query_param("sitekey", "0x4AAA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 1, "request": "7"})))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 1, "request": "token-abc"})))
            .mount(&server)
            .await;

        server
    }

    /// Short observer timeouts and a configured solver; runs on the real clock
    fn solving_strategy(launcher: &FakeLauncher, server: &MockServer) -> BrowserStrategy {
        let handle = BrowserHandle::new(
            Arc::new(launcher.clone()),
            FingerprintManager::new(BrowserSettings::default().fingerprints),
        );
        let challenge = ChallengeSettings {
            min_content_length: 200,
            title_timeout_secs: 1,
            navigation_timeout_secs: 1,
            grace_period_secs: 0,
            poll_interval_ms: 50,
            ..ChallengeSettings::default()
        };
        let solver = CaptchaSolver::from_settings(&CaptchaSettings {
            api_key: Some("secret".to_string()),
            service_url: server.uri(),
            poll_interval_secs: 0,
            timeout_secs: 5,
        });

        BrowserStrategy::new(
            handle,
            ChallengeDetector::new(&challenge),
            BehaviorSimulator::new(BrowserBehavior {
                enabled: false,
                ..BrowserBehavior::default()
            }),
            &ScraperSettings::default(),
            challenge,
        )
        .with_captcha_solver(solver)
    }

    fn ctx() -> AttemptContext {
        AttemptContext {
            url: "https://classifieds.example/s-bikes".to_string(),
            proxy: ProxyDescriptor::direct(),
            session_id: "fetch-test".to_string(),
            attempt: 1,
            force_recreate: false,
        }
    }

    #[tokio::test]
    async fn test_plain_page_returns_document() {
        let launcher = FakeLauncher::with_pages(vec![real_page()]);
        let strategy = strategy(&launcher, None);

        let html = strategy.attempt(&ctx()).await.unwrap();

        assert!(html.contains("aditem"));
        let state = launcher.state.lock().unwrap();
        assert_eq!(state.navigations.len(), 1);
        assert!(state.scripts.iter().any(|s| s.contains("'webdriver', undefined")));
    }

    #[tokio::test]
    async fn test_lenient_navigation_retry() {
        let failing = FakePage {
            navigation_error: Some("net::ERR_ABORTED".to_string()),
            ..FakePage::default()
        };
        let launcher = FakeLauncher::with_pages(vec![failing, real_page()]);
        let strategy = strategy(&launcher, None);

        strategy.attempt(&ctx()).await.unwrap();

        let waits: Vec<WaitCondition> = launcher.state.lock().unwrap().navigations.iter().map(|(_, w)| *w).collect();
        assert_eq!(waits, vec![WaitCondition::Load, WaitCondition::DomReady]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_clears() {
        let launcher = FakeLauncher::with_pages(vec![gate(Some(real_page()))]);
        let strategy = strategy(&launcher, None);

        let html = strategy.attempt(&ctx()).await.unwrap();

        assert!(html.contains("aditem"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_challenge_fails_after_grace() {
        let launcher = FakeLauncher::with_pages(vec![gate(None)]);
        let strategy = strategy(&launcher, None);

        let started = Instant::now();
        let err = strategy.attempt(&ctx()).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Challenge(_))));
        // Observers (20s) then the grace period (10s)
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_artifacts_saved_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let launcher = FakeLauncher::with_pages(vec![real_page()]);
        strategy(&launcher, Some(store.clone())).attempt(&ctx()).await.unwrap();

        let saved = store.load("classifieds.example").await.unwrap().unwrap();
        assert_eq!(saved.cookies[0].name, "session");

        // A fresh browser restores them and reloads the page
        let launcher = FakeLauncher::with_pages(vec![real_page()]);
        strategy(&launcher, Some(store)).attempt(&ctx()).await.unwrap();

        let state = launcher.state.lock().unwrap();
        assert_eq!(state.navigations.len(), 2);
        assert!(state.scripts.iter().any(|s| s.contains("localStorage.setItem")));
    }

    #[tokio::test]
    async fn test_marker_only_gate_is_solved() {
        let server = captcha_service().await;
        let launcher = FakeLauncher::with_pages(vec![turnstile_gate(Some(real_page()))]);
        let strategy = solving_strategy(&launcher, &server);

        let html = strategy.attempt(&ctx()).await.unwrap();

        assert!(html.contains("aditem"));
        let scripts = launcher.state.lock().unwrap().scripts.clone();
        assert!(scripts
            .iter()
            .any(|s| s.contains("cf-turnstile-response") && s.contains("token-abc")));
    }

    #[tokio::test]
    async fn test_gate_surviving_solve_is_unresolved() {
        let server = captcha_service().await;
        let launcher = FakeLauncher::with_pages(vec![turnstile_gate(None)]);
        let strategy = solving_strategy(&launcher, &server);

        let err = strategy.attempt(&ctx()).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<FetchError>(), Some(FetchError::CaptchaUnresolved(_))));
        assert_eq!(classify(&err).kind, ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_unresolved_captcha_stops_pipeline() {
        let server = captcha_service().await;
        let launcher = FakeLauncher::with_pages(vec![turnstile_gate(None)]);
        let strategy = Arc::new(solving_strategy(&launcher, &server));

        let proxies = Arc::new(ProxySessionManager::new(ProxySettings::default(), Vec::new()));
        let settings = ScraperSettings {
            max_attempts: 3,
            verify_proxy_ip: false,
            ..ScraperSettings::default()
        };
        let pipeline = ResilientFetchPipeline::new(proxies, strategy, settings, MetricsCollector::new());

        let err = pipeline
            .fetch("https://classifieds.example/s-bikes", SessionType::ReadOnly)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Fatal { attempt: 1, .. }));
        assert_eq!(launcher.state.lock().unwrap().navigations.len(), 1);
    }
}
