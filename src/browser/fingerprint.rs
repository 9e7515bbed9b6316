use anyhow::{Context, Result};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::config::BrowserFingerprint;

/// Browser fingerprint generator and manager
#[derive(Clone)]
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,
}

/// Viewport dimensions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Complete browser fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub hardware_concurrency: u32,
}

impl FingerprintManager {
    /// Create a new fingerprint manager with the given fingerprints
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Self {
        Self { fingerprints }
    }

    /// Select a random fingerprint
    pub fn random_fingerprint(&self) -> Result<CompleteFingerprint> {
        if self.fingerprints.is_empty() {
            anyhow::bail!("No fingerprints available");
        }

        let mut rng = thread_rng();
        let fingerprint = &self.fingerprints[rng.gen_range(0..self.fingerprints.len())];

        Ok(self.complete_fingerprint(fingerprint))
    }

    /// Get a specific fingerprint by name
    pub fn get_fingerprint(&self, name: &str) -> Result<CompleteFingerprint> {
        let fingerprint = self
            .fingerprints
            .iter()
            .find(|f| f.name == name)
            .context(format!("Fingerprint not found: {}", name))?;

        Ok(self.complete_fingerprint(fingerprint))
    }

    /// Complete a basic fingerprint with randomized details
    fn complete_fingerprint(&self, fingerprint: &BrowserFingerprint) -> CompleteFingerprint {
        let mut rng = thread_rng();

        let viewport = if fingerprint.user_agent.contains("Mobile") {
            Viewport {
                width: rng.gen_range(360..430),
                height: rng.gen_range(640..932),
            }
        } else {
            // Common desktop sizes with a little noise
            const DESKTOP: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768), (1680, 1050)];
            let (width, height) = DESKTOP[rng.gen_range(0..DESKTOP.len())];
            Viewport {
                width: width - rng.gen_range(0..16),
                height: height - rng.gen_range(0..80),
            }
        };

        // WebGL info follows the platform
        let (webgl_vendor, webgl_renderer) = if fingerprint.platform.contains("Win") {
            (
                "Google Inc. (Intel)".to_string(),
                "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)".to_string(),
            )
        } else if fingerprint.platform.contains("Mac") {
            ("Apple Inc.".to_string(), "Apple GPU".to_string())
        } else {
            (
                "Mesa".to_string(),
                "Mesa DRI Intel(R) HD Graphics 620 (Kaby Lake GT2)".to_string(),
            )
        };

        let complete = CompleteFingerprint {
            name: fingerprint.name.clone(),
            user_agent: fingerprint.user_agent.clone(),
            accept_language: fingerprint.accept_language.clone(),
            platform: fingerprint.platform.clone(),
            viewport,
            webgl_vendor,
            webgl_renderer,
            hardware_concurrency: [4, 8, 12, 16][rng.gen_range(0..4)],
        };

        debug!("Generated fingerprint: {}", complete.name);

        complete
    }
}

impl CompleteFingerprint {
    /// Primary language tag, e.g. `de-DE`
    pub fn primary_language(&self) -> &str {
        self.accept_language
            .split(',')
            .next()
            .map(|tag| tag.split(';').next().unwrap_or(tag).trim())
            .filter(|tag| !tag.is_empty())
            .unwrap_or("en-US")
    }

    /// Language tags without quality weights
    pub fn languages(&self) -> Vec<String> {
        self.accept_language
            .split(',')
            .filter_map(|tag| tag.split(';').next())
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    /// Script that hides common automation tells and aligns navigator
    /// properties with this fingerprint
    pub fn stealth_script(&self) -> String {
        let languages = serde_json::to_string(&self.languages()).unwrap_or_else(|_| "[]".to_string());
        let platform = serde_json::to_string(&self.platform).unwrap_or_else(|_| "\"\"".to_string());
        let vendor = serde_json::to_string(&self.webgl_vendor).unwrap_or_else(|_| "\"\"".to_string());
        let renderer = serde_json::to_string(&self.webgl_renderer).unwrap_or_else(|_| "\"\"".to_string());

        format!(
            r#"(() => {{
  const define = (obj, prop, value) => {{
    try {{ Object.defineProperty(obj, prop, {{ get: () => value, configurable: true }}); }} catch (e) {{}}
  }};
  define(Navigator.prototype, 'webdriver', undefined);
  define(Navigator.prototype, 'languages', {languages});
  define(Navigator.prototype, 'platform', {platform});
  define(Navigator.prototype, 'hardwareConcurrency', {cores});
  if (!window.chrome) {{ window.chrome = {{ runtime: {{}} }}; }}
  const patch = (proto) => {{
    if (!proto) return;
    const original = proto.getParameter;
    proto.getParameter = function (param) {{
      if (param === 37445) return {vendor};
      if (param === 37446) return {renderer};
      return original.call(this, param);
    }};
  }};
  patch(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
  patch(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);
  return true;
}})();"#,
            languages = languages,
            platform = platform,
            cores = self.hardware_concurrency,
            vendor = vendor,
            renderer = renderer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FingerprintManager {
        FingerprintManager::new(vec![BrowserFingerprint {
            name: "windows_chrome".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/124.0".to_string(),
            accept_language: "de-DE,de;q=0.9,en;q=0.8".to_string(),
            platform: "Win32".to_string(),
        }])
    }

    #[test]
    fn test_random_fingerprint() {
        let fingerprint = manager().random_fingerprint().unwrap();

        assert_eq!(fingerprint.name, "windows_chrome");
        assert!(fingerprint.viewport.width > 1300 && fingerprint.viewport.width <= 1920);
        assert!(fingerprint.webgl_vendor.contains("Intel"));
    }

    #[test]
    fn test_empty_manager_fails() {
        assert!(FingerprintManager::new(Vec::new()).random_fingerprint().is_err());
        assert!(manager().get_fingerprint("missing").is_err());
    }

    #[test]
    fn test_languages() {
        let fingerprint = manager().get_fingerprint("windows_chrome").unwrap();

        assert_eq!(fingerprint.primary_language(), "de-DE");
        assert_eq!(fingerprint.languages(), vec!["de-DE", "de", "en"]);
    }

    #[test]
    fn test_stealth_script_embeds_fingerprint() {
        let fingerprint = manager().random_fingerprint().unwrap();
        let script = fingerprint.stealth_script();

        assert!(script.contains("'webdriver', undefined"));
        assert!(script.contains("[\"de-DE\",\"de\",\"en\"]"));
        assert!(script.contains("\"Win32\""));
    }
}
