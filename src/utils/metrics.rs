use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::fetch::classifier::ErrorKind;

/// Fetch metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Total fetch attempts made
    pub total_attempts: usize,

    /// Attempts that returned a document
    pub successful_attempts: usize,

    /// Failed attempts
    pub failed_attempts: usize,

    /// Failures by classification
    pub failures_by_kind: HashMap<String, usize>,

    /// Attempt durations per host in milliseconds
    pub attempt_durations: HashMap<String, Vec<u64>>,

    /// Bytes of HTML retrieved
    pub bytes_downloaded: usize,

    /// Listings forwarded to the notifier
    pub notifications_sent: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            failures_by_kind: HashMap::new(),
            attempt_durations: HashMap::new(),
            bytes_downloaded: 0,
            notifications_sent: 0,
        }
    }
}

impl Metrics {
    /// Average attempt duration across every host
    pub fn average_duration_ms(&self) -> Option<u64> {
        let (sum, count) = self
            .attempt_durations
            .values()
            .flatten()
            .fold((0u64, 0u64), |(sum, count), d| (sum + d, count + 1));

        (count > 0).then(|| sum / count)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record one fetch attempt; `failure` is `None` on success
    pub async fn record_attempt(&self, url: &str, failure: Option<ErrorKind>, duration_ms: u64, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_attempts += 1;

        match failure {
            None => metrics.successful_attempts += 1,
            Some(kind) => {
                metrics.failed_attempts += 1;
                *metrics.failures_by_kind.entry(format!("{:?}", kind)).or_default() += 1;
            }
        }

        metrics.bytes_downloaded += bytes;

        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        metrics.attempt_durations.entry(host).or_default().push(duration_ms);
    }

    pub async fn record_notifications(&self, count: usize) {
        self.metrics.lock().await.notifications_sent += count;
    }

    /// Start timing an attempt
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Write a one-line summary to the log
    pub async fn log_summary(&self) {
        let metrics = self.get_metrics().await;
        info!(
            "Fetch metrics: {} attempts ({} ok, {} failed {:?}), {} bytes, avg {} ms, {} notifications",
            metrics.total_attempts,
            metrics.successful_attempts,
            metrics.failed_attempts,
            metrics.failures_by_kind,
            metrics.bytes_downloaded,
            metrics.average_duration_ms().unwrap_or(0),
            metrics.notifications_sent
        );
    }

    /// Reset metrics
    pub async fn reset(&self) {
        *self.metrics.lock().await = Metrics::default();
    }
}

/// Request timer for measuring attempt durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_attempts() {
        let collector = MetricsCollector::new();

        collector.record_attempt("https://classifieds.example/a", None, 100, 5000).await;
        collector
            .record_attempt("https://classifieds.example/b", Some(ErrorKind::ProxyRelated), 300, 0)
            .await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_attempts, 2);
        assert_eq!(metrics.successful_attempts, 1);
        assert_eq!(metrics.failures_by_kind["ProxyRelated"], 1);
        assert_eq!(metrics.attempt_durations["classifieds.example"].len(), 2);
        assert_eq!(metrics.average_duration_ms(), Some(200));

        collector.reset().await;
        assert_eq!(collector.get_metrics().await.total_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_follows_tokio_clock() {
        let timer = MetricsCollector::new().start_timer();
        tokio::time::advance(std::time::Duration::from_millis(250)).await;

        assert_eq!(timer.end(), 250);
    }
}
