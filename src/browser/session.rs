use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info};

use crate::browser::fingerprint::{CompleteFingerprint, FingerprintManager};
use crate::fetch::error::FetchError;
use crate::proxy::source::ProxyDescriptor;

/// How long navigation waits before handing control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Full page load
    Load,
    /// The document is parsed; subresources may still be loading
    DomReady,
}

/// The browser operations the fetch pipeline relies on
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&mut self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<()>;
    async fn title(&self) -> Result<String>;
    async fn current_url(&self) -> Result<String>;
    async fn source(&self) -> Result<String>;
    async fn execute(&self, script: &str) -> Result<serde_json::Value>;
    async fn quit(&mut self) -> Result<()>;
}

/// Starts browsers bound to a proxy and fingerprint
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, proxy: &ProxyDescriptor, fingerprint: &CompleteFingerprint) -> Result<Box<dyn BrowserDriver>>;
}

/// Launches Chrome through a WebDriver server
pub struct WebDriverLauncher {
    webdriver_url: String,
    headless: bool,
}

impl WebDriverLauncher {
    pub fn new(webdriver_url: &str, headless: bool) -> Self {
        Self {
            webdriver_url: webdriver_url.to_string(),
            headless,
        }
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self, proxy: &ProxyDescriptor, fingerprint: &CompleteFingerprint) -> Result<Box<dyn BrowserDriver>> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", fingerprint.primary_language()))?;
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            fingerprint.viewport.width, fingerprint.viewport.height
        ))?;

        if self.headless {
            caps.set_headless()?;
        }

        if let Some(proxy_url) = proxy.url() {
            caps.add_chrome_arg(&format!("--proxy-server={}", proxy_url))?;
        }

        // Fingerprinting protection
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-first-run")?;
        caps.add_chrome_option("excludeSwitches", serde_json::json!(["enable-automation"]))?;
        caps.add_chrome_option("useAutomationExtension", false)?;

        let driver = WebDriver::new(&self.webdriver_url, caps)
            .await
            .map_err(|e| FetchError::Browser(format!("Failed to connect to WebDriver: {}", e)))?;

        debug!(
            "Browser launched with fingerprint {} via proxy {}",
            fingerprint.name, proxy.id
        );

        Ok(Box::new(WebDriverBrowser { driver: Some(driver) }))
    }
}

/// thirtyfour-backed browser
pub struct WebDriverBrowser {
    driver: Option<WebDriver>,
}

impl WebDriverBrowser {
    fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("Browser session not initialized")
    }

    async fn ready_state(&self) -> Result<String> {
        let ret = self.driver()?.execute("return document.readyState;", Vec::new()).await?;
        Ok(ret.json().as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    async fn navigate(&mut self, url: &str, wait: WaitCondition, limit: Duration) -> Result<()> {
        let driver = self.driver()?;
        driver.set_page_load_timeout(limit).await?;

        debug!("Navigating to {} ({:?})", url, wait);
        let outcome = timeout(limit + Duration::from_secs(5), driver.goto(url)).await;

        match wait {
            WaitCondition::Load => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(FetchError::Navigation(format!("{}: {}", url, e)).into()),
                Err(_) => Err(FetchError::Timeout(format!("navigation to {} exceeded {:?}", url, limit)).into()),
            },
            WaitCondition::DomReady => {
                // A load timeout is acceptable here as long as the document is usable
                if let Ok(Err(e)) = &outcome {
                    debug!("Lenient navigation continuing after: {}", e);
                }

                let deadline = Instant::now() + limit;
                loop {
                    let state = self.ready_state().await.unwrap_or_default();
                    if state == "interactive" || state == "complete" {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(FetchError::Timeout(format!(
                            "document at {} never became interactive",
                            url
                        ))
                        .into());
                    }
                    sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn title(&self) -> Result<String> {
        Ok(self.driver()?.title().await.context("Failed to get page title")?)
    }

    async fn current_url(&self) -> Result<String> {
        let url = self.driver()?.current_url().await.context("Failed to get current URL")?;
        Ok(url.to_string())
    }

    async fn source(&self) -> Result<String> {
        Ok(self.driver()?.source().await.context("Failed to get page source")?)
    }

    async fn execute(&self, script: &str) -> Result<serde_json::Value> {
        let ret = self
            .driver()?
            .execute(script, Vec::new())
            .await
            .context("Failed to execute JavaScript")?;
        Ok(ret.json().clone())
    }

    async fn quit(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            driver.quit().await.context("Failed to quit browser")?;
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for WebDriverBrowser {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

/// A live browser and the identity it was started with
pub struct ActiveBrowser {
    pub proxy_id: String,
    pub fingerprint: CompleteFingerprint,
    pub driver: Box<dyn BrowserDriver>,
    visited_hosts: HashSet<String>,
}

impl ActiveBrowser {
    /// True the first time a host is seen by this browser instance
    pub fn first_visit(&mut self, host: &str) -> bool {
        self.visited_hosts.insert(host.to_string())
    }
}

/// The single browser shared by the process.
///
/// The browser is recreated whenever the bound proxy changes. The lock is
/// held for a whole attempt, so concurrent callers queue instead of
/// starting a second instance.
pub struct BrowserHandle {
    launcher: Arc<dyn BrowserLauncher>,
    fingerprints: FingerprintManager,
    slot: Mutex<Option<ActiveBrowser>>,
}

impl BrowserHandle {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, fingerprints: FingerprintManager) -> Self {
        Self {
            launcher,
            fingerprints,
            slot: Mutex::new(None),
        }
    }

    /// Lock the browser bound to `proxy`, recreating it if needed
    pub async fn acquire(&self, proxy: &ProxyDescriptor, force_recreate: bool) -> Result<MappedMutexGuard<'_, ActiveBrowser>> {
        let mut slot = self.slot.lock().await;

        let stale = match slot.as_ref() {
            Some(active) if force_recreate => {
                info!("Recreating browser bound to {}", active.proxy_id);
                true
            }
            Some(active) if active.proxy_id != proxy.id => {
                info!("Proxy changed from {} to {}, recreating browser", active.proxy_id, proxy.id);
                true
            }
            _ => false,
        };

        if stale {
            Self::close_slot(&mut slot).await;
        }

        if slot.is_none() {
            let fingerprint = self.fingerprints.random_fingerprint()?;
            let driver = self.launcher.launch(proxy, &fingerprint).await?;
            *slot = Some(ActiveBrowser {
                proxy_id: proxy.id.clone(),
                fingerprint,
                driver,
                visited_hosts: HashSet::new(),
            });
        }

        MutexGuard::try_map(slot, |slot| slot.as_mut())
            .map_err(|_| anyhow::anyhow!("Browser session not initialized"))
    }

    /// Shut the current browser down, if any
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        Self::close_slot(&mut slot).await;
    }

    async fn close_slot(slot: &mut Option<ActiveBrowser>) {
        if let Some(mut active) = slot.take() {
            if let Err(e) = active.driver.quit().await {
                error!("Error closing browser session: {:#}", e);
            }
        }
    }
}
