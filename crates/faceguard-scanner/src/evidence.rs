//! Evidence capture: court-usable screenshots for a subset of matches.
//!
//! The headless browser is an external collaborator behind
//! [`ScreenshotClient`]; the production implementation proxies a screenshot
//! service. The process holds one client, lazily initialized, with an
//! explicit shutdown hook (see `ScannerContext`).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use faceguard::download::TempStore;
use faceguard::error::{Error, Result};
use tracing::{debug, warn};

/// Captures a page screenshot to a local file.
#[async_trait]
pub trait ScreenshotClient: Send + Sync {
    /// Capture a screenshot of `url`. `Ok(None)` means the page could not
    /// be captured; the match simply goes without evidence.
    async fn capture(&self, url: &str) -> Result<Option<PathBuf>>;

    /// Release the underlying browser. Called once at scanner shutdown.
    async fn shutdown(&self) {}
}

/// Screenshot client backed by a headless-browser service
/// (`POST /screenshot {"url": ..., "full_page": true}` returning PNG bytes).
pub struct BrowserScreenshotter {
    client: reqwest::Client,
    base_url: String,
    temp: TempStore,
}

impl BrowserScreenshotter {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, temp: TempStore) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::config("screenshot_service_url is required"));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            temp,
        })
    }
}

#[async_trait]
impl ScreenshotClient for BrowserScreenshotter {
    async fn capture(&self, url: &str) -> Result<Option<PathBuf>> {
        let response = self
            .client
            .post(format!("{}/screenshot", self.base_url))
            .json(&serde_json::json!({ "url": url, "full_page": true }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, %status, "screenshot capture failed");
            return Ok(None);
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            warn!(url, "screenshot capture returned no bytes");
            return Ok(None);
        }

        let dest = self.temp.allocate(".png");
        tokio::fs::write(&dest, &bytes).await?;
        debug!(url, path = %dest.display(), "screenshot captured");
        Ok(Some(dest))
    }

    async fn shutdown(&self) {
        // Best effort: let the service release its browser.
        let _ = self
            .client
            .post(format!("{}/shutdown", self.base_url))
            .send()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_store() -> (tempfile::TempDir, TempStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().join("scratch")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_requires_url() {
        let (_guard, temp) = temp_store();
        assert!(BrowserScreenshotter::new("", temp).is_err());
    }

    #[tokio::test]
    async fn test_capture_writes_png() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/screenshot"))
            .and(body_partial_json(serde_json::json!({
                "url": "https://instagram.com/impersonator",
                "full_page": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-bytes".to_vec()))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let shooter = BrowserScreenshotter::new(&server.uri(), temp).unwrap();
        let path = shooter
            .capture("https://instagram.com/impersonator")
            .await
            .unwrap()
            .unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG-bytes");
    }

    #[tokio::test]
    async fn test_capture_failure_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let shooter = BrowserScreenshotter::new(&server.uri(), temp).unwrap();
        assert!(shooter.capture("https://x.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_empty_body_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let shooter = BrowserScreenshotter::new(&server.uri(), temp).unwrap();
        assert!(shooter.capture("https://x.example").await.unwrap().is_none());
    }
}
