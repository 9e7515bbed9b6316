use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::browser::{
    ArtifactStore, BehaviorSimulator, BrowserHandle, CaptchaSolver, ChallengeDetector, FingerprintManager,
    WebDriverLauncher,
};
use crate::cli::config::{FetchStrategyKind, WatcherConfig};
use crate::crawler::{ScrapeTaskQueue, ScrapeWorker, SelectorListingParser, WorkerParts};
use crate::fetch::{AttemptStrategy, BrowserStrategy, ResilientFetchPipeline, SolverStrategy};
use crate::notify::build_notifier;
use crate::proxy::manager::ProxySessionManager;
use crate::proxy::source::load_proxies;
use crate::storage::seen::open_seen_store;
use crate::utils::metrics::MetricsCollector;
use crate::utils::rate_limiter::RateLimiter;

/// Everything a command needs, wired from the configuration
pub struct Runtime {
    pub worker: ScrapeWorker,
    pub proxies: Arc<ProxySessionManager>,
    pub strategy: Arc<dyn AttemptStrategy>,
    pub metrics: MetricsCollector,
}

impl Runtime {
    /// Release the browser or other strategy resources
    pub async fn shutdown(&self) {
        self.strategy.invalidate().await;
        self.metrics.log_summary().await;
    }
}

fn build_strategy(config: &WatcherConfig) -> Result<Arc<dyn AttemptStrategy>> {
    let artifacts_dir = config
        .browser
        .artifacts_dir
        .clone()
        .unwrap_or_else(|| WatcherConfig::data_dir().join("artifacts"));
    let store = Some(ArtifactStore::new(artifacts_dir));

    let strategy: Arc<dyn AttemptStrategy> = match config.scraper.strategy {
        FetchStrategyKind::Browser => {
            let launcher = WebDriverLauncher::new(&config.browser.webdriver_url, config.browser.headless);
            let browser = BrowserHandle::new(
                Arc::new(launcher),
                FingerprintManager::new(config.browser.fingerprints.clone()),
            );
            let captcha = CaptchaSolver::from_settings(&config.captcha);
            if captcha.is_none() {
                info!("No captcha API key configured, challenges fall back to waiting");
            }

            Arc::new(
                BrowserStrategy::new(
                    browser,
                    ChallengeDetector::new(&config.challenge),
                    BehaviorSimulator::new(config.browser.behavior.clone()),
                    &config.scraper,
                    config.challenge.clone(),
                )
                .with_captcha_solver(captcha)
                .with_artifact_store(store),
            )
        }
        FetchStrategyKind::Solver => Arc::new(SolverStrategy::new(&config.solver)?.with_artifact_store(store)),
    };

    info!("Using {} fetch strategy", strategy.name());
    Ok(strategy)
}

/// Wire the worker and its collaborators from `config`
pub async fn build_runtime(config: &WatcherConfig) -> Result<Runtime> {
    let pool = load_proxies(&config.proxy.proxies, config.proxy.proxy_file.as_deref())
        .context("Failed to load proxies")?;
    let proxies = Arc::new(ProxySessionManager::new(config.proxy.clone(), pool));
    let metrics = MetricsCollector::new();
    let strategy = build_strategy(config)?;

    let pipeline = ResilientFetchPipeline::new(
        proxies.clone(),
        strategy.clone(),
        config.scraper.clone(),
        metrics.clone(),
    );

    let parts = WorkerParts {
        queue: ScrapeTaskQueue::new(Duration::from_millis(config.queue.poll_interval_ms)),
        fetcher: Arc::new(pipeline),
        parser: Arc::new(SelectorListingParser::new(&config.parser)?),
        seen: open_seen_store(&config.storage).await?,
        notifier: build_notifier(&config.notifier)?,
        limiter: RateLimiter::new(config.rate_limit.capacity, config.rate_limit.refill_per_second),
        metrics: metrics.clone(),
    };

    let worker = ScrapeWorker::new(parts, config.subscriptions.clone());
    worker.start();

    Ok(Runtime {
        worker,
        proxies,
        strategy,
        metrics,
    })
}

/// Baselines, then periodic sweeps until Ctrl-C
pub async fn run(config: WatcherConfig) -> Result<()> {
    let runtime = build_runtime(&config).await?;

    if config.schedule.initialize_on_start {
        runtime.worker.initialize_missing().await?;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.schedule.sweep_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                runtime.worker.run_sweep_cycle().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    let status = runtime.worker.status().await;
    if status.current_task.is_some() || status.queue_length > 0 {
        warn!(
            "Abandoning {} pending tasks (running: {})",
            status.queue_length,
            status.current_task.as_deref().unwrap_or("none")
        );
    }

    runtime.shutdown().await;
    Ok(())
}

/// One sweep, then exit once the queue drains
pub async fn sweep(config: WatcherConfig) -> Result<()> {
    let runtime = build_runtime(&config).await?;

    runtime.worker.run_sweep_cycle().await;
    runtime.worker.wait_idle().await;

    runtime.shutdown().await;
    Ok(())
}

/// Fetch one page and print its listings or the error
pub async fn lookup(config: WatcherConfig, url: &str, json: bool) -> Result<()> {
    url::Url::parse(url).context(format!("Invalid URL: {}", url))?;
    let runtime = build_runtime(&config).await?;

    let result = runtime.worker.lookup(url).await;
    runtime.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if let Some(error) = &result.error {
        println!("Lookup failed: {}", error);
        return Ok(());
    }

    println!("{} listings:", result.listings.len());
    for listing in &result.listings {
        println!(
            "  [{}] {} {}",
            listing.id,
            listing.title,
            listing.price.as_deref().unwrap_or("")
        );
        println!("      {}", listing.url);
    }

    Ok(())
}

/// Print the exit IP of every proxy
pub async fn check_proxies(config: WatcherConfig) -> Result<()> {
    let pool = load_proxies(&config.proxy.proxies, config.proxy.proxy_file.as_deref())
        .context("Failed to load proxies")?;
    let manager = ProxySessionManager::new(config.proxy.clone(), pool);

    for (proxy_id, outcome) in manager.check_all().await {
        match outcome {
            Ok(ip) => println!("  {:<30} {}", proxy_id, ip),
            Err(e) => println!("  {:<30} FAILED: {:#}", proxy_id, e),
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config(config: &WatcherConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("Current configuration:");
    println!("{}", yaml);

    Ok(())
}

/// Write a default configuration file
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Configuration file already exists: {}", path.display());
    }

    WatcherConfig::default().save_to_file(path)?;
    println!("Created default configuration: {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::StorageBackend;

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.yaml");

        init_config(&path).unwrap();
        assert!(WatcherConfig::load_from_file(&path).is_ok());
        assert!(init_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_build_runtime_with_solver_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatcherConfig::default();
        config.scraper.strategy = FetchStrategyKind::Solver;
        config.storage.backend = StorageBackend::Memory;
        config.browser.artifacts_dir = Some(dir.path().to_path_buf());
        config.proxy.proxies = vec!["user:pass@10.0.0.1:8080".to_string()];

        let runtime = build_runtime(&config).await.unwrap();

        assert_eq!(runtime.strategy.name(), "solver");
        assert_eq!(runtime.proxies.snapshot().len(), 1);
        assert!(runtime.worker.status().await.current_task.is_none());
    }
}
