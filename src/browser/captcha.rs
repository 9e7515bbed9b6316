use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::cli::config::CaptchaSettings;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("no site key found for {0:?} widget")]
    MissingSiteKey(CaptchaKind),

    #[error("captcha service rejected the request: {0}")]
    Service(String),

    #[error("captcha not solved within {0:?}")]
    Timeout(Duration),

    #[error("captcha service unreachable: {0}")]
    Http(#[from] reqwest::Error),
}

/// Widget families the solving service understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaKind {
    Turnstile,
    ReCaptcha,
    HCaptcha,
}

impl CaptchaKind {
    fn method(&self) -> &'static str {
        match self {
            CaptchaKind::Turnstile => "turnstile",
            CaptchaKind::ReCaptcha => "userrecaptcha",
            CaptchaKind::HCaptcha => "hcaptcha",
        }
    }

    fn key_param(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptcha => "googlekey",
            _ => "sitekey",
        }
    }
}

/// A widget found on a page
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaChallenge {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: String,
}

fn site_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#).expect("site key pattern is valid")
    })
}

/// Find the CAPTCHA widget embedded in `html`
pub fn detect_captcha(html: &str, page_url: &str) -> Result<Option<CaptchaChallenge>, CaptchaError> {
    let kind = if html.contains("cf-turnstile") || html.contains("challenges.cloudflare.com/turnstile") {
        CaptchaKind::Turnstile
    } else if html.contains("h-captcha") || html.contains("hcaptcha.com") {
        CaptchaKind::HCaptcha
    } else if html.contains("g-recaptcha") || html.contains("google.com/recaptcha") {
        CaptchaKind::ReCaptcha
    } else {
        return Ok(None);
    };

    let site_key = site_key_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(CaptchaError::MissingSiteKey(kind))?;

    Ok(Some(CaptchaChallenge {
        kind,
        site_key,
        page_url: page_url.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    status: i64,
    request: String,
}

/// Client for a 2captcha-compatible solving service
pub struct CaptchaSolver {
    client: reqwest::Client,
    api_key: String,
    service_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl CaptchaSolver {
    /// `None` when no API key is configured
    pub fn from_settings(settings: &CaptchaSettings) -> Option<Self> {
        let api_key = settings.api_key.clone().filter(|k| !k.is_empty())?;

        Some(Self {
            client: reqwest::Client::new(),
            api_key,
            service_url: settings.service_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }

    /// Submit the widget and poll until the service returns a token
    pub async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        timeout(self.timeout, self.solve_unbounded(challenge))
            .await
            .map_err(|_| CaptchaError::Timeout(self.timeout))?
    }

    async fn solve_unbounded(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let submitted: ServiceResponse = self
            .client
            .get(format!("{}/in.php", self.service_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("method", challenge.kind.method()),
                (challenge.kind.key_param(), challenge.site_key.as_str()),
                ("pageurl", challenge.page_url.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if submitted.status != 1 {
            return Err(CaptchaError::Service(submitted.request));
        }

        let task_id = submitted.request;
        info!("Submitted {:?} captcha as task {}", challenge.kind, task_id);

        loop {
            sleep(self.poll_interval).await;

            let polled: ServiceResponse = self
                .client
                .get(format!("{}/res.php", self.service_url))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id.as_str()),
                    ("json", "1"),
                ])
                .send()
                .await?
                .json()
                .await?;

            if polled.status == 1 {
                debug!("Captcha task {} solved", task_id);
                return Ok(polled.request);
            }
            if polled.request != "CAPCHA_NOT_READY" {
                return Err(CaptchaError::Service(polled.request));
            }
        }
    }
}

/// Script writing `token` into the widget's response fields and firing its callback
pub fn injection_script(kind: CaptchaKind, token: &str) -> String {
    let token = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    let fields = match kind {
        CaptchaKind::Turnstile => r#"['[name="cf-turnstile-response"]', '[name="g-recaptcha-response"]']"#,
        CaptchaKind::ReCaptcha => r#"['[name="g-recaptcha-response"]', '#g-recaptcha-response']"#,
        CaptchaKind::HCaptcha => r#"['[name="h-captcha-response"]', '[name="g-recaptcha-response"]']"#,
    };

    format!(
        r#"(() => {{
  const token = {token};
  for (const selector of {fields}) {{
    document.querySelectorAll(selector).forEach((el) => {{ el.value = token; el.innerHTML = token; }});
  }}
  const widget = document.querySelector('[data-callback]');
  const callback = widget && window[widget.getAttribute('data-callback')];
  if (typeof callback === 'function') {{ callback(token); return 'callback'; }}
  const form = widget ? widget.closest('form') : document.querySelector('form');
  if (form) {{ form.submit(); return 'submit'; }}
  return 'injected';
}})();"#,
        token = token,
        fields = fields,
    )
}
