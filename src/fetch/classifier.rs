//! Maps raw fetch failures onto a retry decision.
//!
//! Rules are checked in order and the first match wins: fatal, then
//! proxy-related, then transient. Anything unrecognised is treated as
//! transient so unknown errors get retried rather than failing fast.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::fetch::error::FetchError;

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Retry on the same proxy after a backoff
    Transient,
    /// Penalize the proxy and retry on another one
    ProxyRelated,
    /// Stop immediately
    Fatal,
}

/// Result of classifying one failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub can_retry: bool,
    pub status_code: Option<u16>,
    pub message: String,
}

const FATAL_STATUSES: &[u16] = &[403, 410, 451];
const PROXY_STATUSES: &[u16] = &[407, 502, 503];
const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 504];

fn fatal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)permanently blocked|ip (address )?(has been )?banned|access denied|captcha unresolved|captcha (was )?not solved",
        )
        .expect("fatal pattern is valid")
    })
}

fn proxy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)proxy|tunnel|econnrefused|connection refused|econnreset|connection reset|etimedout|timed out|timeout|dns|enotfound|getaddrinfo|name resolution|network|socket hang up",
        )
        .expect("proxy pattern is valid")
    })
}

fn transient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)rate limit|too many requests|try again|retry later|temporarily unavailable")
            .expect("transient pattern is valid")
    })
}

fn status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:http|status(?: code)?)[\s:=]*([1-5]\d\d)\b")
            .expect("status pattern is valid")
    })
}

/// Classify an error raised anywhere in the fetch path
pub fn classify(error: &anyhow::Error) -> ErrorClassification {
    let status = extract_status(error);
    classify_parts(status, &format!("{:#}", error))
}

/// Classify a bare message, e.g. an error string returned by a remote service
pub fn classify_message(message: &str) -> ErrorClassification {
    classify_parts(status_from_message(message), message)
}

fn extract_status(error: &anyhow::Error) -> Option<u16> {
    for cause in error.chain() {
        if let Some(fetch_error) = cause.downcast_ref::<FetchError>() {
            if let Some(status) = fetch_error.status_code() {
                return Some(status);
            }
        }
        if let Some(http_error) = cause.downcast_ref::<reqwest::Error>() {
            if let Some(status) = http_error.status() {
                return Some(status.as_u16());
            }
        }
    }

    status_from_message(&format!("{:#}", error))
}

fn status_from_message(message: &str) -> Option<u16> {
    status_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[allow(clippy::if_same_then_else)]
fn classify_parts(status: Option<u16>, message: &str) -> ErrorClassification {
    let has_status = |set: &[u16]| status.map_or(false, |s| set.contains(&s));

    let kind = if has_status(FATAL_STATUSES) || fatal_pattern().is_match(message) {
        ErrorKind::Fatal
    } else if has_status(PROXY_STATUSES) || proxy_pattern().is_match(message) {
        ErrorKind::ProxyRelated
    } else if has_status(TRANSIENT_STATUSES) || transient_pattern().is_match(message) {
        ErrorKind::Transient
    } else {
        ErrorKind::Transient
    };

    ErrorClassification {
        kind,
        can_retry: kind != ErrorKind::Fatal,
        status_code: status,
        message: message.to_string(),
    }
}
