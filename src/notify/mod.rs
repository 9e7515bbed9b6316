use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::config::{NotifierKind, NotifierSettings, Subscription};
use crate::crawler::task::Listing;

/// Delivers a new listing to one recipient
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, subscription: &Subscription, listing: &Listing) -> Result<()>;
}

/// Build the notifier selected in the settings
pub fn build_notifier(settings: &NotifierSettings) -> Result<Arc<dyn Notifier>> {
    match settings.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Telegram => {
            let token = settings
                .telegram_token
                .as_deref()
                .context("notifier.telegram_token is required for the telegram notifier")?;
            Ok(Arc::new(TelegramNotifier::new(&settings.telegram_api_url, token)?))
        }
    }
}

/// Plain-text message body for a listing
pub fn format_listing(subscription: &Subscription, listing: &Listing) -> String {
    let mut lines = vec![format!("New in \"{}\": {}", subscription.name, listing.title)];
    if let Some(price) = &listing.price {
        lines.push(format!("Price: {}", price));
    }
    if let Some(location) = &listing.location {
        lines.push(format!("Location: {}", location));
    }
    lines.push(listing.url.clone());
    lines.join("\n")
}

/// Writes notifications to the log instead of sending them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, subscription: &Subscription, listing: &Listing) -> Result<()> {
        info!(
            "[{} -> {}] {}",
            subscription.id,
            recipient,
            format_listing(subscription, listing).replace('\n', " | ")
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

/// Sends messages through the Telegram Bot API
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_url.trim_end_matches('/'), token),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: &str, subscription: &Subscription, listing: &Listing) -> Result<()> {
        let message = SendMessage {
            chat_id: recipient,
            text: format_listing(subscription, listing),
            disable_web_page_preview: false,
        };

        let response: TelegramResponse = self
            .client
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .context("Failed to reach Telegram")?
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !response.ok {
            anyhow::bail!(
                "Telegram rejected message to {} (status {}): {}",
                recipient,
                response.error_code.unwrap_or_default(),
                response.description.unwrap_or_default()
            );
        }

        debug!("Sent listing {} to {}", listing.id, recipient);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscription() -> Subscription {
        Subscription {
            id: "bikes".to_string(),
            name: "Road bikes".to_string(),
            url: "https://classifieds.example/s-bikes/k0".to_string(),
            recipients: vec!["42".to_string()],
            active: true,
        }
    }

    fn listing() -> Listing {
        Listing {
            id: "1001".to_string(),
            title: "Road bike".to_string(),
            url: "https://classifieds.example/s-anzeige/1001".to_string(),
            price: Some("450 €".to_string()),
            location: None,
            image_url: None,
        }
    }

    #[test]
    fn test_format_listing() {
        let text = format_listing(&subscription(), &listing());

        assert!(text.starts_with("New in \"Road bikes\": Road bike"));
        assert!(text.contains("Price: 450 €"));
        assert!(!text.contains("Location"));
        assert!(text.ends_with("https://classifieds.example/s-anzeige/1001"));
    }

    #[tokio::test]
    async fn test_telegram_send() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({ "chat_id": "42" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true, "result": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(&server.uri(), "TOKEN").unwrap();
        notifier.notify("42", &subscription(), &listing()).await.unwrap();
    }

    #[tokio::test]
    async fn test_telegram_rejection() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 5"
            })))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(&server.uri(), "TOKEN").unwrap();
        let err = notifier.notify("42", &subscription(), &listing()).await.unwrap_err();

        assert!(err.to_string().contains("Too Many Requests"));
    }

    #[test]
    fn test_build_requires_token() {
        let settings = NotifierSettings {
            kind: NotifierKind::Telegram,
            ..NotifierSettings::default()
        };

        assert!(build_notifier(&settings).is_err());
        assert!(build_notifier(&NotifierSettings::default()).is_ok());
    }
}
