use std::fmt;
use std::sync::Arc;

use crate::cli::config::ChallengeSettings;

type Predicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Recognizes anti-bot interstitials from a page's title and HTML.
///
/// Built from configured patterns; extra predicates can be layered on
/// when a site starts serving a gate the patterns miss.
#[derive(Clone)]
pub struct ChallengeDetector {
    title_patterns: Vec<String>,
    html_markers: Vec<String>,
    captcha_markers: Vec<String>,
    min_content_length: usize,
    extra: Vec<Predicate>,
}

impl fmt::Debug for ChallengeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeDetector")
            .field("title_patterns", &self.title_patterns)
            .field("html_markers", &self.html_markers)
            .field("captcha_markers", &self.captcha_markers)
            .field("min_content_length", &self.min_content_length)
            .field("extra", &self.extra.len())
            .finish()
    }
}

impl ChallengeDetector {
    pub fn new(settings: &ChallengeSettings) -> Self {
        let lower = |items: &[String]| items.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();

        Self {
            title_patterns: lower(&settings.title_patterns),
            html_markers: lower(&settings.html_markers),
            captcha_markers: lower(&settings.captcha_markers),
            min_content_length: settings.min_content_length,
            extra: Vec::new(),
        }
    }

    /// Add a custom check over `(title, html)`
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.extra.push(Arc::new(predicate));
        self
    }

    pub fn is_challenge_title(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.title_patterns.iter().any(|p| title.contains(p.as_str()))
    }

    pub fn has_challenge_markers(&self, html: &str) -> bool {
        let html = html.to_lowercase();
        self.html_markers.iter().any(|m| html.contains(m.as_str()))
    }

    pub fn has_captcha(&self, html: &str) -> bool {
        let html = html.to_lowercase();
        self.captcha_markers.iter().any(|m| html.contains(m.as_str()))
    }

    /// Whether the page looks like a challenge gate
    pub fn is_challenge(&self, title: &str, html: &str) -> bool {
        self.is_challenge_title(title)
            || self.has_challenge_markers(html)
            || self.extra.iter().any(|predicate| predicate(title, html))
    }

    /// Long enough to be real content
    pub fn is_substantial(&self, html: &str) -> bool {
        html.len() >= self.min_content_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChallengeDetector {
        ChallengeDetector::new(&ChallengeSettings::default())
    }

    #[test]
    fn test_title_detection_is_case_insensitive() {
        let detector = detector();

        assert!(detector.is_challenge_title("Just a moment..."));
        assert!(detector.is_challenge_title("JUST A MOMENT"));
        assert!(!detector.is_challenge_title("Road bikes | Classifieds"));
    }

    #[test]
    fn test_markers() {
        let detector = detector();
        let gate = r#"<html><body><div id="cf-challenge-running"></div><div class="cf-turnstile" data-sitekey="0x4AAA"></div></body></html>"#;

        assert!(detector.has_challenge_markers(gate));
        assert!(detector.has_captcha(gate));
        assert!(detector.is_challenge("Classifieds", gate));
        assert!(!detector.is_challenge("Classifieds", "<html><body>listings</body></html>"));
    }

    #[test]
    fn test_custom_predicate() {
        let detector = detector().with_predicate(|_, html| html.contains("bot-wall"));

        assert!(detector.is_challenge("Classifieds", "<div class=\"bot-wall\"></div>"));
    }

    #[test]
    fn test_substantial_threshold() {
        let detector = ChallengeDetector::new(&ChallengeSettings {
            min_content_length: 10,
            ..ChallengeSettings::default()
        });

        assert!(!detector.is_substantial("short"));
        assert!(detector.is_substantial("long enough html"));
    }
}
