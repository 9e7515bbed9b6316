use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Scheduling class of a task; lower values run first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Baseline of a freshly added subscription
    Initialization = 1,
    /// A lookup a user is waiting on
    UserRequest = 2,
    /// Periodic sweep
    Scheduled = 3,
}

/// Work run by the queue
pub type TaskAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A scrape job waiting in the queue
pub struct ScrapeTask {
    /// Identity; re-enqueueing the same id replaces the pending task
    pub id: String,
    pub priority: Priority,
    pub action: TaskAction,
    pub enqueued_at: Instant,
}

impl fmt::Debug for ScrapeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// One listing pulled out of a results page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    /// Stable across fetches of the same listing
    pub id: String,
    pub title: String,
    pub url: String,
    pub price: Option<String>,
    pub location: Option<String>,
    pub image_url: Option<String>,
}

/// Outcome of a user-triggered lookup.
///
/// Failures are reported in `error` with no listings instead of as an `Err`,
/// so the caller can render them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LookupResult {
    pub listings: Vec<Listing>,
    pub error: Option<String>,
}

impl LookupResult {
    pub fn found(listings: Vec<Listing>) -> Self {
        Self {
            listings,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            listings: Vec::new(),
            error: Some(error.into()),
        }
    }
}
