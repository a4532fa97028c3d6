//! # faceguard-tineye
//!
//! TinEye reverse-image-search client. A contributor's reference photo goes
//! up as a multipart upload; the response's match backlinks come back as
//! (page URL, image URL) pairs that the scan worker feeds through the
//! standard per-image pipeline.

use std::sync::Arc;
use std::time::Duration;

use faceguard::breaker::CircuitBreaker;
use faceguard::error::{Error, Result};
use faceguard::ratelimit::TokenBucket;
use faceguard::retry::{retry_async, RetryPolicy};
use serde::Deserialize;
use tracing::{info, warn};

/// One backlink from a TinEye match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlink {
    /// The hosting page.
    pub page_url: String,
    /// The matched image itself.
    pub image_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    image_url: Option<String>,
    #[serde(default)]
    backlinks: Vec<ApiBacklink>,
}

#[derive(Debug, Deserialize)]
struct ApiBacklink {
    url: Option<String>,
}

/// TinEye REST API client.
pub struct TinEyeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl TinEyeClient {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the API key is missing, or an
    /// HTTP error if the client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: &str,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::config("tineye_api_key is required"));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter,
            breaker,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy (tests use single-attempt policies).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Search one image, returning every backlink across all matches.
    ///
    /// # Errors
    ///
    /// Returns `Error::CircuitOpen` when the provider is tripping, and a
    /// provider error on non-2xx responses.
    pub async fn search(&self, image_bytes: Vec<u8>) -> Result<Vec<Backlink>> {
        self.breaker
            .call(retry_async(self.retry, "tineye_search", || {
                let image_bytes = image_bytes.clone();
                async move {
                    self.limiter.acquire().await;
                    let part = reqwest::multipart::Part::bytes(image_bytes)
                        .file_name("search.jpg")
                        .mime_str("image/jpeg")
                        .map_err(Error::Http)?;
                    let form = reqwest::multipart::Form::new().part("image_upload", part);

                    let response = self
                        .client
                        .post(format!("{}/rest/search/", self.base_url))
                        .header("x-api-key", &self.api_key)
                        .multipart(form)
                        .send()
                        .await?
                        .error_for_status()?;

                    let payload: SearchResponse = response.json().await?;
                    let backlinks: Vec<Backlink> = payload
                        .matches
                        .iter()
                        .flat_map(|m| {
                            m.backlinks.iter().filter_map(|b| {
                                let page_url = b.url.clone()?;
                                Some(Backlink {
                                    image_url: m
                                        .image_url
                                        .clone()
                                        .unwrap_or_else(|| page_url.clone()),
                                    page_url,
                                })
                            })
                        })
                        .collect();
                    Ok(backlinks)
                }
            }))
            .await
            .map(|backlinks| {
                info!(results = backlinks.len(), "tineye search complete");
                backlinks
            })
            .map_err(|e| {
                if !e.is_circuit_open() {
                    warn!(error = %e, "tineye search failed");
                }
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceguard::ratelimit::RateLimit;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
        }
    }

    fn client_against(server: &MockServer) -> TinEyeClient {
        TinEyeClient::new(
            &server.uri(),
            "api-key",
            Arc::new(TokenBucket::new(RateLimit::new(1000.0, 1000.0))),
            Arc::new(CircuitBreaker::new("tineye")),
        )
        .unwrap()
        .with_retry_policy(fast_retry())
    }

    #[test]
    fn test_new_requires_api_key() {
        let limiter = Arc::new(TokenBucket::new(RateLimit::new(1.0, 1.0)));
        let breaker = Arc::new(CircuitBreaker::new("tineye"));
        assert!(TinEyeClient::new("https://api.tineye.com", "", limiter, breaker).is_err());
    }

    #[tokio::test]
    async fn test_search_parses_backlinks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/search/"))
            .and(header("x-api-key", "api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "matches": [
                    {
                        "image_url": "https://cdn.example.com/stolen.jpg",
                        "backlinks": [
                            {"url": "https://blog.example.com/post"},
                            {"url": "https://forum.example.com/thread"},
                        ],
                    },
                    {
                        "image_url": null,
                        "backlinks": [{"url": "https://gallery.example.net/img"}],
                    },
                ],
            })))
            .mount(&server)
            .await;

        let client = client_against(&server);
        let backlinks = client.search(vec![0xFF, 0xD8, 0xFF]).await.unwrap();

        assert_eq!(backlinks.len(), 3);
        assert_eq!(backlinks[0].image_url, "https://cdn.example.com/stolen.jpg");
        assert_eq!(backlinks[0].page_url, "https://blog.example.com/post");
        // Missing image_url falls back to the backlink page.
        assert_eq!(backlinks[2].image_url, "https://gallery.example.net/img");
    }

    #[tokio::test]
    async fn test_search_empty_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"matches": []})))
            .mount(&server)
            .await;

        let client = client_against(&server);
        let backlinks = client.search(vec![1, 2, 3]).await.unwrap();
        assert!(backlinks.is_empty());
    }

    #[tokio::test]
    async fn test_search_non_2xx_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("quota exhausted"))
            .mount(&server)
            .await;

        let client = client_against(&server);
        assert!(client.search(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_failures_trip_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TinEyeClient::new(
            &server.uri(),
            "api-key",
            Arc::new(TokenBucket::new(RateLimit::new(1000.0, 1000.0))),
            Arc::new(CircuitBreaker::with_settings(
                "tineye",
                2,
                Duration::from_secs(60),
            )),
        )
        .unwrap()
        .with_retry_policy(fast_retry());

        assert!(!client.search(vec![1]).await.unwrap_err().is_circuit_open());
        assert!(!client.search(vec![1]).await.unwrap_err().is_circuit_open());
        // Third call fails fast without hitting the server.
        assert!(client.search(vec![1]).await.unwrap_err().is_circuit_open());
    }
}
