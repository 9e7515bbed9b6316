pub mod logging;
pub mod metrics;
pub mod rate_limiter;

// Re-export common functions and types
pub use logging::{default_log_file, init_logging};
pub use metrics::{Metrics, MetricsCollector, RequestTimer};
pub use rate_limiter::{RateLimiter, RateLimiterError};
