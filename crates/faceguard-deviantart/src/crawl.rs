//! DeviantArt crawl implementation: OAuth2 token handling and multi-page
//! tag browsing with resumable offsets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use faceguard::breaker::CircuitBreaker;
use faceguard::discovery::{
    DetectionStrategy, DiscoveredImageResult, DiscoveryContext, DiscoveryResult, DiscoverySource,
};
use faceguard::error::{Error, Result};
use faceguard::ratelimit::TokenBucket;
use faceguard::retry::{retry_async, RetryPolicy};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// AI-generated content tags.
pub const AI_BROWSE_TAGS: [&str; 7] = [
    "aiart",
    "ai_generated",
    "aiportrait",
    "stable_diffusion",
    "midjourney",
    "ai_face",
    "deepfake",
];

/// Photorealistic human content — high face-yield tags.
pub const PHOTO_TAGS: [&str; 12] = [
    "photography",
    "photorealistic",
    "beauty",
    "glamour",
    "model",
    "portrait",
    "headshot",
    "celebrity",
    "woman",
    "man",
    "face",
    "realistic",
];

/// The default tag set when the taxonomy mapper supplies none.
#[must_use]
pub fn default_tags() -> Vec<String> {
    AI_BROWSE_TAGS
        .iter()
        .chain(PHOTO_TAGS.iter())
        .map(|t| (*t).to_string())
        .collect()
}

/// Re-exported constant form for callers that only need the count.
pub const DEFAULT_TAGS: usize = AI_BROWSE_TAGS.len() + PHOTO_TAGS.len();

/// Images per browse page (API maximum is 24 for tag browsing).
const PAGE_LIMIT: u32 = 24;

/// Refresh the OAuth token this long before its actual expiry.
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Provider settings, from the scanner configuration.
#[derive(Debug, Clone)]
pub struct DeviantArtConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Default pages per tag per tick.
    pub max_pages: u32,
    /// Pages per tick for high-damage tags (nude, deepfake, celebfakes...).
    pub high_damage_pages: u32,
    /// Pages per tick for person-focused tags.
    pub medium_damage_pages: u32,
    /// Pages per tick for generic tags.
    pub low_damage_pages: u32,
}

impl Default for DeviantArtConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.deviantart.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            max_pages: 2,
            high_damage_pages: 2,
            medium_damage_pages: 1,
            low_damage_pages: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct BrowseResponse {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_offset: Option<i64>,
    #[serde(default)]
    results: Vec<Deviation>,
}

#[derive(Debug, Deserialize)]
struct Deviation {
    url: Option<String>,
    title: Option<String>,
    content: Option<DeviationContent>,
}

#[derive(Debug, Deserialize)]
struct DeviationContent {
    src: Option<String>,
}

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<Instant>,
}

/// DeviantArt platform crawl (DEFERRED strategy).
pub struct DeviantArtCrawl {
    config: DeviantArtConfig,
    client: reqwest::Client,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    token: Mutex<TokenState>,
    retry: RetryPolicy,
}

impl DeviantArtCrawl {
    /// Build the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        config: DeviantArtConfig,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            limiter,
            breaker,
            token: Mutex::new(TokenState::default()),
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy (tests use single-attempt policies).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Page depth for a tag: explicit mapper override first, then the
    /// default depth.
    fn pages_for_tag(&self, tag: &str, depths: Option<&HashMap<String, u32>>) -> u32 {
        depths
            .and_then(|d| d.get(tag).copied())
            .unwrap_or(self.config.max_pages)
            .max(1)
    }

    /// Ensure a live OAuth2 client-credentials token, refreshing inside the
    /// early-refresh buffer.
    async fn ensure_token(&self) -> Result<String> {
        {
            let state = self.token.lock().await;
            if let (Some(token), Some(expires_at)) = (&state.token, state.expires_at) {
                if Instant::now() < expires_at {
                    return Ok(token.clone());
                }
            }
        }
        self.fetch_token().await
    }

    async fn fetch_token(&self) -> Result<String> {
        let response = retry_async(self.retry, "deviantart_token", || async move {
            let response = self
                .client
                .post(format!("{}/oauth2/token", self.config.base_url))
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?;
            let payload: TokenResponse = response.json().await?;
            Ok(payload)
        })
        .await?;

        let mut state = self.token.lock().await;
        state.token = Some(response.access_token.clone());
        state.expires_at = Some(
            Instant::now() + Duration::from_secs(response.expires_in)
                - TOKEN_REFRESH_BUFFER.min(Duration::from_secs(response.expires_in)),
        );
        info!(expires_in = response.expires_in, "deviantart token acquired");
        Ok(response.access_token)
    }

    async fn clear_token(&self) {
        let mut state = self.token.lock().await;
        state.token = None;
        state.expires_at = None;
    }

    /// Fetch one page of tag browse results. Returns the deviations and the
    /// next offset (None when the tag is exhausted).
    async fn fetch_tag_page(
        &self,
        token: &str,
        tag: &str,
        offset: i64,
    ) -> Result<(Vec<DiscoveredImageResult>, Option<i64>)> {
        self.breaker
            .call(retry_async(self.retry, "deviantart_tag_page", || async move {
                self.limiter.acquire().await;
                let response = self
                    .client
                    .get(format!(
                        "{}/api/v1/oauth2/browse/tags",
                        self.config.base_url
                    ))
                    .query(&[
                        ("tag", tag.to_string()),
                        ("offset", offset.to_string()),
                        ("limit", PAGE_LIMIT.to_string()),
                        ("mature_content", "true".to_string()),
                    ])
                    .bearer_auth(token)
                    .send()
                    .await?;

                if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                    // Token expired mid-crawl; clear so the next discover
                    // call refreshes it.
                    self.clear_token().await;
                    return Err(Error::provider("deviantart token expired (401)"));
                }
                let response = response.error_for_status()?;
                let payload: BrowseResponse = response.json().await?;

                let results = payload
                    .results
                    .iter()
                    .filter_map(|deviation| {
                        // Literature and text posts carry no image content.
                        let src = deviation.content.as_ref()?.src.clone()?;
                        let mut image = DiscoveredImageResult::new(src, "deviantart");
                        image.page_url = deviation.url.clone();
                        image.page_title = deviation
                            .title
                            .as_deref()
                            .filter(|t| !t.is_empty())
                            .map(|t| t.chars().take(200).collect());
                        Some(image)
                    })
                    .collect();

                let next_offset = if payload.has_more {
                    payload.next_offset
                } else {
                    None
                };
                Ok((results, next_offset))
            }))
            .await
    }

    /// Fetch up to the tag's page depth. Returns the images and the final
    /// cursor: None when the tag is exhausted (restart from 0 next tick),
    /// the last good offset otherwise.
    async fn fetch_tag_pages(
        &self,
        token: &str,
        tag: &str,
        start_offset: Option<&str>,
        max_pages: u32,
    ) -> Result<(Vec<DiscoveredImageResult>, Option<String>)> {
        let mut all_results = Vec::new();
        let mut offset: i64 = start_offset.and_then(|o| o.parse().ok()).unwrap_or(0);

        for page in 1..=max_pages {
            let (results, next_offset) = self.fetch_tag_page(token, tag, offset).await?;
            debug!(tag, page, offset, count = results.len(), "deviantart page fetched");
            all_results.extend(results);

            match next_offset {
                Some(next) => offset = next,
                None => return Ok((all_results, None)),
            }
        }

        // Reached the depth limit: save the offset to resume next tick.
        Ok((all_results, Some(offset.to_string())))
    }
}

#[async_trait]
impl DiscoverySource for DeviantArtCrawl {
    fn source_type(&self) -> &'static str {
        "platform_crawl"
    }

    fn source_name(&self) -> &'static str {
        "deviantart"
    }

    fn detection_strategy(&self) -> DetectionStrategy {
        DetectionStrategy::Deferred
    }

    async fn discover(&self, context: &DiscoveryContext) -> Result<DiscoveryResult> {
        let tags: Vec<String> = context
            .search_terms
            .clone()
            .unwrap_or_else(default_tags);
        let saved = context.search_cursors.clone().unwrap_or_default();
        let depths = context.tag_depths.as_ref();

        let token = match self.ensure_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "deviantart token error");
                return Ok(DiscoveryResult {
                    tags_total: tags.len() as u32,
                    ..DiscoveryResult::default()
                });
            }
        };

        let mut images = Vec::new();
        let mut cursors: HashMap<String, Option<String>> = HashMap::new();
        let mut circuit_open = false;

        for tag in &tags {
            if circuit_open {
                // Not attempted this tick: the saved cursor survives as-is.
                cursors.insert(tag.clone(), saved.get(tag).cloned());
                continue;
            }
            let pages = self.pages_for_tag(tag, depths);
            match self
                .fetch_tag_pages(&token, tag, saved.get(tag).map(String::as_str), pages)
                .await
            {
                Ok((tag_images, final_offset)) => {
                    images.extend(tag_images);
                    cursors.insert(tag.clone(), final_offset);
                }
                Err(e) if e.is_circuit_open() => {
                    warn!(tag, "deviantart circuit open; aborting platform tick");
                    cursors.insert(tag.clone(), saved.get(tag).cloned());
                    circuit_open = true;
                }
                Err(e) => {
                    warn!(tag, error = %e, "deviantart tag error");
                    cursors.insert(tag.clone(), saved.get(tag).cloned());
                }
            }
        }

        let tags_exhausted = cursors.values().filter(|c| c.is_none()).count() as u32;
        info!(
            results_found = images.len(),
            tags_total = tags.len(),
            tags_exhausted,
            "deviantart crawl complete"
        );

        Ok(DiscoveryResult {
            images,
            next_cursor: None,
            search_cursors: Some(cursors),
            model_cursors: None,
            tags_total: tags.len() as u32,
            tags_exhausted,
            faces_found: 0,
        })
    }
}
