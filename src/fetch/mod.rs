pub mod browser_strategy;
pub mod classifier;
pub mod error;
pub mod pipeline;
pub mod solver;

use async_trait::async_trait;

use crate::proxy::manager::SessionType;

pub use browser_strategy::BrowserStrategy;
pub use classifier::{classify, classify_message, ErrorClassification, ErrorKind};
pub use error::FetchError;
pub use pipeline::{AttemptContext, AttemptStrategy, ResilientFetchPipeline};
pub use solver::SolverStrategy;

/// Anything that can turn a URL into an HTML document
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, session_type: SessionType) -> Result<String, FetchError>;
}
