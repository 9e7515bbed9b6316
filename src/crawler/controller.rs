use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::Subscription;
use crate::crawler::parser::ListingParser;
use crate::crawler::scheduler::{QueueStatus, ScrapeTaskQueue};
use crate::crawler::task::{Listing, LookupResult, Priority};
use crate::fetch::PageFetcher;
use crate::notify::Notifier;
use crate::proxy::manager::SessionType;
use crate::storage::seen::SeenStore;
use crate::utils::metrics::MetricsCollector;
use crate::utils::rate_limiter::RateLimiter;

const SWEEP_TASK_ID: &str = "sweep";

/// Collaborators the worker composes
pub struct WorkerParts {
    pub queue: ScrapeTaskQueue,
    pub fetcher: Arc<dyn PageFetcher>,
    pub parser: Arc<dyn ListingParser>,
    pub seen: Arc<dyn SeenStore>,
    pub notifier: Arc<dyn Notifier>,
    pub limiter: RateLimiter,
    pub metrics: MetricsCollector,
}

struct WorkerInner {
    parts: WorkerParts,
    subscriptions: Vec<Subscription>,
}

/// Product-level scrape operations routed through the priority queue:
/// periodic sweeps, user lookups and subscription baselines.
#[derive(Clone)]
pub struct ScrapeWorker {
    inner: Arc<WorkerInner>,
}

impl ScrapeWorker {
    pub fn new(parts: WorkerParts, subscriptions: Vec<Subscription>) -> Self {
        Self {
            inner: Arc::new(WorkerInner { parts, subscriptions }),
        }
    }

    /// Start the queue worker
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.inner.parts.queue.start()
    }

    pub async fn status(&self) -> QueueStatus {
        self.inner.parts.queue.status().await
    }

    pub async fn wait_idle(&self) {
        self.inner.parts.queue.wait_idle().await
    }

    fn active_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.inner.subscriptions.iter().filter(|s| s.active)
    }

    /// Queue a sweep over every active subscription.
    ///
    /// Returns false when a sweep is already pending or running.
    pub async fn run_sweep_cycle(&self) -> bool {
        let queue = &self.inner.parts.queue;
        if queue.is_queued(SWEEP_TASK_ID).await {
            info!("Sweep already queued, skipping this cycle");
            return false;
        }

        let worker = self.clone();
        queue
            .enqueue(SWEEP_TASK_ID, Priority::Scheduled, move || async move { worker.sweep().await })
            .await;
        true
    }

    /// Fetch and parse `url` ahead of scheduled work
    pub async fn lookup(&self, url: &str) -> LookupResult {
        let (tx, rx) = oneshot::channel();
        let worker = self.clone();
        let target = url.to_string();

        self.inner
            .parts
            .queue
            .enqueue(&format!("lookup:{}", Uuid::new_v4()), Priority::UserRequest, move || async move {
                let outcome = worker.fetch_listings(&target).await;
                let _ = tx.send(outcome);
                Ok(())
            })
            .await;

        match rx.await {
            Ok(Ok(listings)) => LookupResult::found(listings),
            Ok(Err(e)) => {
                warn!("Lookup of {} failed: {:#}", url, e);
                LookupResult::failed(format!("{:#}", e))
            }
            Err(_) => LookupResult::failed("lookup was dropped before it ran"),
        }
    }

    /// Queue a baseline for `subscription` so existing listings are not announced
    pub async fn initialize_subscription(&self, subscription: Subscription) {
        let worker = self.clone();
        let id = format!("init:{}", subscription.id);

        self.inner
            .parts
            .queue
            .enqueue(&id, Priority::Initialization, move || async move {
                worker.record_baseline(&subscription).await.map(|_| ())
            })
            .await;
    }

    /// Queue baselines for every active subscription without one
    pub async fn initialize_missing(&self) -> Result<usize> {
        let mut queued = 0;
        for subscription in self.active_subscriptions() {
            if !self.inner.parts.seen.is_initialized(&subscription.id).await? {
                self.initialize_subscription(subscription.clone()).await;
                queued += 1;
            }
        }

        if queued > 0 {
            info!("Queued {} subscription baselines", queued);
        }
        Ok(queued)
    }

    async fn fetch_listings(&self, url: &str) -> Result<Vec<Listing>> {
        let parts = &self.inner.parts;
        let html = parts.fetcher.fetch(url, SessionType::ReadOnly).await?;
        parts
            .parser
            .parse_listings(&html, url)
            .context(format!("Failed to parse listings from {}", url))
    }

    async fn record_baseline(&self, subscription: &Subscription) -> Result<usize> {
        let parts = &self.inner.parts;
        let listings = self.fetch_listings(&subscription.url).await?;
        let ids: Vec<String> = listings.iter().map(|l| l.id.clone()).collect();

        parts.seen.mark_seen(&subscription.id, &ids).await?;
        parts.seen.mark_initialized(&subscription.id).await?;

        info!("Baseline for {}: {} listings", subscription.id, ids.len());
        Ok(ids.len())
    }

    /// Check one subscription and notify its recipients of new listings
    async fn check_subscription(&self, subscription: &Subscription) -> Result<usize> {
        let parts = &self.inner.parts;

        if !parts.seen.is_initialized(&subscription.id).await? {
            debug!("{} has no baseline yet, recording one", subscription.id);
            self.record_baseline(subscription).await?;
            return Ok(0);
        }

        let listings = self.fetch_listings(&subscription.url).await?;
        let ids: Vec<String> = listings.iter().map(|l| l.id.clone()).collect();
        let new_ids = parts.seen.filter_new(&subscription.id, &ids).await?;

        if new_ids.is_empty() {
            debug!("No new listings for {}", subscription.id);
            return Ok(0);
        }

        let fresh: Vec<&Listing> = listings.iter().filter(|l| new_ids.contains(&l.id)).collect();
        info!("{} new listings for {}", fresh.len(), subscription.id);

        let mut sent = 0;
        let mut handled: Vec<String> = Vec::new();
        let mut interrupted = None;

        'listings: for listing in &fresh {
            for recipient in &subscription.recipients {
                if let Err(e) = parts.limiter.acquire().await {
                    interrupted = Some(e);
                    break 'listings;
                }
                if handled.last() != Some(&listing.id) {
                    handled.push(listing.id.clone());
                }
                match parts.notifier.notify(recipient, subscription, listing).await {
                    Ok(()) => sent += 1,
                    Err(e) => error!(
                        "Failed to notify {} about listing {}: {:#}",
                        recipient, listing.id, e
                    ),
                }
            }
        }

        parts.metrics.record_notifications(sent).await;

        // Anything already announced stays seen even if the pass was cut short
        if let Some(e) = interrupted {
            parts.seen.mark_seen(&subscription.id, &handled).await?;
            return Err(e).context(format!(
                "Notifications for {} interrupted after {} of {} listings",
                subscription.id,
                handled.len(),
                fresh.len()
            ));
        }

        parts.seen.mark_seen(&subscription.id, &new_ids).await?;

        Ok(fresh.len())
    }

    async fn sweep(&self) -> Result<()> {
        let mut failures = 0;
        let mut found = 0;

        for subscription in self.active_subscriptions() {
            match self.check_subscription(subscription).await {
                Ok(count) => found += count,
                Err(e) => {
                    failures += 1;
                    error!("Sweep of {} failed: {:#}", subscription.id, e);
                }
            }
        }

        info!("Sweep finished: {} new listings, {} failed subscriptions", found, failures);
        self.inner.parts.metrics.log_summary().await;

        Ok(())
    }
}
