use thiserror::Error;

/// Failures raised while fetching a page.
///
/// Variants carry enough context for [`crate::fetch::classifier`] to decide
/// between retrying, rotating the proxy and giving up.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream answered with an error status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The page never finished loading
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// A bounded wait expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// The anti-bot challenge was still in place after waiting
    #[error("challenge not cleared: {0}")]
    Challenge(String),

    /// A CAPTCHA stayed unresolved after a solving attempt
    #[error("captcha unresolved after solving attempt: {0}")]
    CaptchaUnresolved(String),

    /// The browser could not be started or driven
    #[error("browser error: {0}")]
    Browser(String),

    /// The proxy refused or dropped the connection
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The external solver service reported a failure
    #[error("solver error: {0}")]
    Solver(String),

    /// A non-retryable failure stopped the fetch early
    #[error("fatal error fetching {url} on attempt {attempt}: {message}")]
    Fatal {
        url: String,
        attempt: u32,
        message: String,
    },

    /// Every attempt failed
    #[error("failed to fetch {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

impl FetchError {
    /// HTTP-like status code carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
