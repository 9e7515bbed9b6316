use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::browser::session::BrowserDriver;

/// One cookie kept between browser sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// Cookies and local storage captured for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionArtifacts {
    pub host: String,
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub local_storage: HashMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

const CAPTURE_SCRIPT: &str = r#"
const storage = {};
try {
  for (let i = 0; i < window.localStorage.length; i++) {
    const key = window.localStorage.key(i);
    storage[key] = window.localStorage.getItem(key);
  }
} catch (e) {}
return { cookies: document.cookie, localStorage: storage };
"#;

impl SessionArtifacts {
    pub fn new(host: &str, cookies: Vec<StoredCookie>, local_storage: HashMap<String, String>) -> Self {
        Self {
            host: host.to_string(),
            cookies,
            local_storage,
            saved_at: Utc::now(),
        }
    }

    /// Read cookies and local storage from the page currently loaded
    pub async fn capture(driver: &dyn BrowserDriver, host: &str) -> Result<Self> {
        let value = driver.execute(CAPTURE_SCRIPT).await?;

        let cookies = value
            .get("cookies")
            .and_then(|c| c.as_str())
            .map(parse_cookie_header)
            .unwrap_or_default();

        let local_storage = value
            .get("localStorage")
            .and_then(|s| s.as_object())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self::new(host, cookies, local_storage))
    }

    /// Write the artifacts into the page currently loaded
    pub async fn restore(&self, driver: &dyn BrowserDriver) -> Result<()> {
        driver.execute(&self.restore_script()?).await?;
        debug!(
            "Restored {} cookies and {} storage entries for {}",
            self.cookies.len(),
            self.local_storage.len(),
            self.host
        );
        Ok(())
    }

    fn restore_script(&self) -> Result<String> {
        let cookies = serde_json::to_string(&self.cookies)?;
        let storage = serde_json::to_string(&self.local_storage)?;

        Ok(format!(
            r#"(() => {{
  for (const c of {cookies}) {{
    document.cookie = encodeURIComponent(c.name) + '=' + encodeURIComponent(c.value) + '; path=/';
  }}
  const storage = {storage};
  try {{
    for (const key of Object.keys(storage)) {{ window.localStorage.setItem(key, storage[key]); }}
  }} catch (e) {{}}
  return true;
}})();"#,
            cookies = cookies,
            storage = storage,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_storage.is_empty()
    }
}

/// Split a `Cookie`-style header (`a=1; b=2`) into name/value pairs
pub fn parse_cookie_header(header: &str) -> Vec<StoredCookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(StoredCookie {
                name: name.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// On-disk store of session artifacts, one JSON file per host
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, host: &str) -> PathBuf {
        let file: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    /// Artifacts saved for `host`, if any. A corrupt file is ignored.
    pub async fn load(&self, host: &str) -> Result<Option<SessionArtifacts>> {
        let path = self.path_for(host);
        if !path.exists() {
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&path)
            .await
            .context(format!("Failed to read session artifacts: {}", path.display()))?;

        match serde_json::from_str(&contents) {
            Ok(artifacts) => Ok(Some(artifacts)),
            Err(e) => {
                warn!("Ignoring unreadable session artifacts {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, artifacts: &SessionArtifacts) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context(format!("Failed to create directory: {}", self.dir.display()))?;

        let path = self.path_for(&artifacts.host);
        let contents = serde_json::to_string_pretty(artifacts)
            .context("Failed to serialize session artifacts")?;

        tokio::fs::write(&path, contents)
            .await
            .context(format!("Failed to write session artifacts: {}", path.display()))?;

        debug!("Saved session artifacts for {}", artifacts.host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fingerprint::FingerprintManager;
    use crate::browser::session::testing::FakeLauncher;
    use crate::browser::session::BrowserLauncher;
    use crate::cli::config::BrowserSettings;
    use crate::proxy::source::ProxyDescriptor;

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("a=1; b = two ; =skip; broken");

        assert_eq!(
            cookies,
            vec![
                StoredCookie { name: "a".into(), value: "1".into() },
                StoredCookie { name: "b".into(), value: "two".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));

        assert!(store.load("classifieds.example").await.unwrap().is_none());

        let artifacts = SessionArtifacts::new(
            "classifieds.example",
            parse_cookie_header("cf_clearance=abc"),
            HashMap::from([("consent".to_string(), "yes".to_string())]),
        );
        store.save(&artifacts).await.unwrap();

        let loaded = store.load("classifieds.example").await.unwrap().unwrap();
        assert_eq!(loaded.cookies[0].name, "cf_clearance");
        assert_eq!(loaded.local_storage["consent"], "yes");
    }

    #[tokio::test]
    async fn test_corrupt_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::write(dir.path().join("classifieds.example.json"), "{not json").unwrap();

        assert!(store.load("classifieds.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_and_restore_through_driver() {
        let launcher = FakeLauncher::default();
        let fingerprint = FingerprintManager::new(BrowserSettings::default().fingerprints)
            .random_fingerprint()
            .unwrap();
        let driver = launcher.launch(&ProxyDescriptor::direct(), &fingerprint).await.unwrap();

        let captured = SessionArtifacts::capture(driver.as_ref(), "classifieds.example").await.unwrap();
        assert_eq!(captured.cookies, parse_cookie_header("session=abc"));
        assert_eq!(captured.local_storage["consent"], "yes");

        captured.restore(driver.as_ref()).await.unwrap();
        let scripts = launcher.state.lock().unwrap().scripts.clone();
        assert!(scripts.last().unwrap().contains("\"session\""));
    }
}
