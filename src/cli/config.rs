use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::proxy::rotation::RotationSettings;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WatcherConfig {
    pub scraper: ScraperSettings,
    pub browser: BrowserSettings,
    pub challenge: ChallengeSettings,
    pub captcha: CaptchaSettings,
    pub solver: SolverSettings,
    pub proxy: ProxySettings,
    pub rate_limit: RateLimitSettings,
    pub queue: QueueSettings,
    pub schedule: ScheduleSettings,
    pub storage: StorageSettings,
    pub notifier: NotifierSettings,
    pub parser: ParserSettings,
    pub subscriptions: Vec<Subscription>,
}

/// Which per-attempt strategy the fetch pipeline drives
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategyKind {
    Browser,
    Solver,
}

/// Fetch pipeline settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScraperSettings {
    pub strategy: FetchStrategyKind,
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    pub navigation_timeout_secs: u64,
    pub lenient_navigation_timeout_secs: u64,
    /// Check the exit IP whenever a fetch lands on a new proxy
    pub verify_proxy_ip: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

/// Browser automation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub fingerprints: Vec<BrowserFingerprint>,
    pub behavior: BrowserBehavior,
    /// Where cookies and local storage are kept between sessions
    pub artifacts_dir: Option<PathBuf>,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
}

/// Human-like presence simulated on loaded pages
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserBehavior {
    pub enabled: bool,
    pub scroll_behavior: String, // "random", "smooth", "none"
    pub scroll_steps: (u32, u32),
    pub pause_ms: (u64, u64),
    pub mouse_movement: bool,
}

/// Anti-bot challenge detection and waiting
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChallengeSettings {
    pub title_patterns: Vec<String>,
    pub html_markers: Vec<String>,
    pub captcha_markers: Vec<String>,
    /// Documents at least this long count as real content
    pub min_content_length: usize,
    pub title_timeout_secs: u64,
    pub navigation_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
}

/// CAPTCHA solving service (2captcha-compatible)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptchaSettings {
    pub api_key: Option<String>,
    pub service_url: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

/// External challenge-solving service (FlareSolverr-compatible)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SolverSettings {
    pub url: String,
    pub max_timeout_ms: u64,
}

/// Proxy pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxySettings {
    /// Entries in `username:password@host:port` form
    pub proxies: Vec<String>,
    pub proxy_file: Option<PathBuf>,
    pub rotation: RotationSettings,
    pub limits: SessionLimits,
    pub recovery_delay_secs: u64,
    pub failure_threshold: u32,
    pub saturation_retry_ms: u64,
    pub handoff_timeout_secs: u64,
    pub handoff_poll_ms: u64,
    pub ip_check_url: Option<String>,
    pub ip_check_timeout_secs: u64,
}

/// How many sticky sessions of each kind may share one proxy
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionLimits {
    pub read_only: u32,
    pub authenticated: u32,
    pub transactional: u32,
}

/// Outbound notification rate limit
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_second: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleSettings {
    pub sweep_interval_secs: u64,
    pub initialize_on_start: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Redis,
}

/// Seen-listing storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub redis_url: String,
    pub key_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    Log,
    Telegram,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotifierSettings {
    pub kind: NotifierKind,
    pub telegram_token: Option<String>,
    pub telegram_api_url: String,
}

/// CSS selectors used to pull listings out of a results page
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ParserSettings {
    pub item_selector: String,
    pub id_attribute: String,
    pub title_selector: String,
    pub link_selector: String,
    pub price_selector: Option<String>,
    pub location_selector: Option<String>,
    pub image_selector: Option<String>,
}

/// A saved search whose new results are pushed to recipients
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            strategy: FetchStrategyKind::Browser,
            max_attempts: 3,
            backoff: BackoffSettings::default(),
            navigation_timeout_secs: 30,
            lenient_navigation_timeout_secs: 15,
            verify_proxy_ip: true,
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 2000,
            max_ms: 30000,
            jitter_ms: 1000,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            fingerprints: vec![
                BrowserFingerprint {
                    name: "windows_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                    accept_language: "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
                    platform: "Win32".to_string(),
                },
                BrowserFingerprint {
                    name: "mac_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                    accept_language: "de-DE,de;q=0.9,en;q=0.8".to_string(),
                    platform: "MacIntel".to_string(),
                },
            ],
            behavior: BrowserBehavior::default(),
            artifacts_dir: None,
        }
    }
}

impl Default for BrowserBehavior {
    fn default() -> Self {
        Self {
            enabled: true,
            scroll_behavior: "random".to_string(),
            scroll_steps: (1, 4),
            pause_ms: (300, 1200),
            mouse_movement: true,
        }
    }
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            title_patterns: vec![
                "Just a moment".to_string(),
                "Attention Required".to_string(),
                "Checking your browser".to_string(),
                "Un instant".to_string(),
                "Einen Moment".to_string(),
            ],
            html_markers: vec![
                "cf-browser-verification".to_string(),
                "challenge-platform".to_string(),
                "cf_chl_opt".to_string(),
                "cf-challenge-running".to_string(),
            ],
            captcha_markers: vec![
                "cf-turnstile".to_string(),
                "g-recaptcha".to_string(),
                "h-captcha".to_string(),
            ],
            min_content_length: 5000,
            title_timeout_secs: 20,
            navigation_timeout_secs: 20,
            grace_period_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            service_url: "https://2captcha.com".to_string(),
            poll_interval_secs: 5,
            timeout_secs: 120,
        }
    }
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8191/v1".to_string(),
            max_timeout_ms: 60000,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            proxy_file: None,
            rotation: RotationSettings::default(),
            limits: SessionLimits::default(),
            recovery_delay_secs: 300,
            failure_threshold: 5,
            saturation_retry_ms: 1000,
            handoff_timeout_secs: 60,
            handoff_poll_ms: 500,
            ip_check_url: Some("https://api.ipify.org?format=json".to_string()),
            ip_check_timeout_secs: 10,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_only: 10,
            authenticated: 3,
            transactional: 1,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        // Telegram tolerates roughly 30 messages per second per bot
        Self {
            capacity: 30,
            refill_per_second: 1.0,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { poll_interval_ms: 100 }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 600,
            initialize_on_start: true,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "watcher".to_string(),
        }
    }
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            telegram_token: None,
            telegram_api_url: "https://api.telegram.org".to_string(),
        }
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            item_selector: "article.aditem".to_string(),
            id_attribute: "data-adid".to_string(),
            title_selector: "h2 a".to_string(),
            link_selector: "h2 a".to_string(),
            price_selector: Some(".aditem-main--middle--price-shipping--price".to_string()),
            location_selector: Some(".aditem-main--top--left".to_string()),
            image_selector: Some("img".to_string()),
        }
    }
}

impl WatcherConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "listing-watch", "listing-watch") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Directory for persisted runtime data (session artifacts, logs)
    pub fn data_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "listing-watch", "listing-watch") {
            proj_dirs.data_dir().to_path_buf()
        } else {
            PathBuf::from("./data")
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the configuration from `path`, or the default file when none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default()?,
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Secrets may come from the environment instead of the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("WATCHER_CAPTCHA_API_KEY") {
            self.captcha.api_key = Some(key);
        }
        if let Ok(token) = std::env::var("WATCHER_TELEGRAM_TOKEN") {
            self.notifier.telegram_token = Some(token);
        }
        if let Ok(url) = std::env::var("WATCHER_SOLVER_URL") {
            self.solver.url = url;
        }
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.scraper.max_attempts == 0 {
            anyhow::bail!("scraper.max_attempts must be at least 1");
        }
        if self.rate_limit.capacity == 0 {
            anyhow::bail!("rate_limit.capacity must be at least 1");
        }
        if !(self.rate_limit.refill_per_second > 0.0) {
            anyhow::bail!("rate_limit.refill_per_second must be positive");
        }

        let rotation = &self.proxy.rotation;
        let minutes = [rotation.base_minutes, rotation.min_minutes, rotation.max_minutes];
        if minutes.iter().any(|m| !m.is_finite() || *m < 0.0) {
            anyhow::bail!("proxy.rotation minutes must be finite and non-negative");
        }
        if !(0.0..1.0).contains(&rotation.jitter_fraction) {
            anyhow::bail!("proxy.rotation.jitter_fraction must be in [0, 1)");
        }
        if rotation.min_minutes > rotation.max_minutes {
            anyhow::bail!("proxy.rotation.min_minutes exceeds max_minutes");
        }

        let limits = &self.proxy.limits;
        if limits.read_only == 0 || limits.authenticated == 0 || limits.transactional == 0 {
            anyhow::bail!("proxy.limits must all be at least 1");
        }

        if self.scraper.strategy == FetchStrategyKind::Browser && self.browser.fingerprints.is_empty() {
            anyhow::bail!("browser.fingerprints must not be empty");
        }
        if self.notifier.kind == NotifierKind::Telegram && self.notifier.telegram_token.is_none() {
            anyhow::bail!("notifier.telegram_token is required for the telegram notifier");
        }

        for subscription in &self.subscriptions {
            url::Url::parse(&subscription.url)
                .context(format!("Subscription {} has an invalid URL", subscription.id))?;
        }

        Ok(())
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        self.save_to_file(&Self::default_path())
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        WatcherConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
scraper:
  strategy: solver
  max_attempts: 5
proxy:
  proxies:
    - "user:pass@10.0.0.1:8080"
subscriptions:
  - id: bikes
    name: Road bikes
    url: "https://classifieds.example/s-bikes/k0"
    recipients: ["12345"]
"#;
        let config: WatcherConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.scraper.strategy, FetchStrategyKind::Solver);
        assert_eq!(config.scraper.max_attempts, 5);
        assert_eq!(config.scraper.backoff.base_ms, 2000);
        assert_eq!(config.proxy.proxies.len(), 1);
        assert_eq!(config.proxy.limits.transactional, 1);
        assert!(config.subscriptions[0].active);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = WatcherConfig::default();
        config.scraper.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = WatcherConfig::default();
        config.proxy.rotation.jitter_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = WatcherConfig::default();
        config.notifier.kind = NotifierKind::Telegram;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unusable_rotation() {
        let broken: [fn(&mut RotationSettings); 5] = [
            |r| r.min_minutes = -1.0,
            |r| r.base_minutes = f64::NAN,
            |r| r.max_minutes = f64::INFINITY,
            |r| r.jitter_fraction = f64::NAN,
            |r| r.min_minutes = f64::NAN,
        ];

        for breakage in broken {
            let mut config = WatcherConfig::default();
            breakage(&mut config.proxy.rotation);
            assert!(config.validate().is_err(), "{:?}", config.proxy.rotation);
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = WatcherConfig::default();
        config.schedule.sweep_interval_secs = 42;
        config.save_to_file(&path).unwrap();

        let loaded = WatcherConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.schedule.sweep_interval_secs, 42);
    }
}
