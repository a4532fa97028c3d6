//! CivitAI crawl implementation: feed, targeted searches, LoRA tag browse,
//! and the two-pass inline detection path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faceguard::breaker::CircuitBreaker;
use faceguard::detector::FaceDetector;
use faceguard::discovery::{
    DetectionStrategy, DiscoveredImageResult, DiscoveryContext, DiscoveryResult, DiscoverySource,
    InlineFace,
};
use faceguard::download::{load_and_resize, ImageDownloader, RESIZE_TARGET};
use faceguard::error::Result;
use faceguard::ratelimit::TokenBucket;
use faceguard::retry::{retry_async, RetryPolicy};
use faceguard_supabase::StorageClient;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Face-targeted image search terms — high-yield queries for face content.
pub const IMAGE_SEARCH_TERMS: [&str; 8] = [
    "woman",
    "man",
    "portrait",
    "photorealistic face",
    "real person",
    "headshot",
    "actress",
    "model",
];

/// Tags selecting human-producing LoRA models on the models API.
pub const LORA_HUMAN_TAGS: [&str; 9] = [
    "realistic",
    "photorealistic",
    "celebrity",
    "person",
    "portrait",
    "photography",
    "face",
    "woman",
    "man",
];

/// Prompt/tag keywords marking feed images likely to contain real faces.
pub const FACE_INDICATORS: [&str; 13] = [
    "portrait",
    "face",
    "person",
    "photorealistic",
    "photo",
    "headshot",
    "selfie",
    "woman",
    "man",
    "girl",
    "boy",
    "realistic",
    "real person",
];

/// Rewrite a CivitAI CDN URL from the full-resolution rendition to a
/// width-constrained one. URLs without the `/original=true/` segment are
/// returned unchanged.
#[must_use]
pub fn thumbnail_url(original_url: &str, width: u32) -> String {
    original_url.replace("/original=true/", &format!("/width={width}/"))
}

/// Provider settings, from the scanner configuration.
#[derive(Debug, Clone)]
pub struct CivitaiConfig {
    pub base_url: String,
    /// Pages per feed/search-term per tick (100 images per page).
    pub max_pages: u32,
    /// Pages per LoRA tag per tick (100 models per page).
    pub model_pages_per_tag: u32,
    /// NSFW browsing level filter; empty disables the parameter.
    pub nsfw_filter: String,
    /// Width of the pass-1 probe rendition.
    pub probe_width: u32,
}

impl Default for CivitaiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://civitai.com".to_string(),
            max_pages: 1,
            model_pages_per_tag: 1,
            nsfw_filter: "None".to_string(),
            probe_width: 450,
        }
    }
}

// --- API payloads ---

#[derive(Debug, Default, Deserialize)]
struct PageMetadata {
    #[serde(rename = "nextCursor")]
    next_cursor: Option<serde_json::Value>,
}

impl PageMetadata {
    /// The API returns string cursors for /images and numeric ones for
    /// /models; both become opaque strings.
    fn cursor_string(&self) -> Option<String> {
        match &self.next_cursor {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    items: Vec<ImageItem>,
    #[serde(default)]
    metadata: PageMetadata,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    id: Option<i64>,
    url: Option<String>,
    #[serde(default)]
    meta: Option<ImageMeta>,
    #[serde(default)]
    tags: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageMeta {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    items: Vec<ModelItem>,
    #[serde(default)]
    metadata: PageMetadata,
}

#[derive(Debug, Deserialize)]
struct ModelItem {
    id: Option<i64>,
    #[serde(default)]
    name: String,
    #[serde(rename = "modelVersions", default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    #[serde(default)]
    images: Vec<ModelImage>,
}

#[derive(Debug, Deserialize)]
struct ModelImage {
    url: Option<String>,
}

/// An image surfaced by any of the three cursor spaces, before detection.
#[derive(Debug, Clone)]
struct Candidate {
    source_url: String,
    page_url: Option<String>,
    page_title: Option<String>,
}

/// Outcome of one multi-page walk: items, the cursor to resume from
/// (None = exhausted), and whether the circuit opened mid-walk.
struct WalkOutcome<T> {
    items: Vec<T>,
    cursor: Option<String>,
    circuit_open: bool,
}

/// Whether a feed item is worth probing: face keywords in the prompt or
/// tags, or an untagged item (no signal either way).
fn has_face_indicator(item: &ImageItem) -> bool {
    if item.tags.is_empty() && item.meta.as_ref().and_then(|m| m.prompt.as_ref()).is_none() {
        return true;
    }
    let prompt = item
        .meta
        .as_ref()
        .and_then(|m| m.prompt.as_deref())
        .unwrap_or("")
        .to_lowercase();
    let tags = item
        .tags
        .iter()
        .map(|t| match t {
            serde_json::Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    FACE_INDICATORS
        .iter()
        .any(|indicator| prompt.contains(indicator) || tags.contains(indicator))
}

/// CivitAI platform crawl (INLINE strategy, two-pass thumbnail probe).
pub struct CivitaiCrawl {
    config: CivitaiConfig,
    client: reqwest::Client,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    downloader: Arc<ImageDownloader>,
    storage: Option<Arc<StorageClient>>,
    retry: RetryPolicy,
}

impl CivitaiCrawl {
    /// Build the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        config: CivitaiConfig,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
        downloader: Arc<ImageDownloader>,
        storage: Option<Arc<StorageClient>>,
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
            downloader,
            storage,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy (tests use single-attempt policies).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch one page of /api/v1/images, optionally query-scoped.
    async fn fetch_images_page(
        &self,
        query: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<(Vec<ImageItem>, Option<String>)> {
        self.breaker
            .call(retry_async(self.retry, "civitai_images_page", || async move {
                self.limiter.acquire().await;
                let mut request = self
                    .client
                    .get(format!("{}/api/v1/images", self.config.base_url))
                    .query(&[("limit", "100"), ("sort", "Newest")]);
                if !self.config.nsfw_filter.is_empty() {
                    request = request.query(&[("nsfw", self.config.nsfw_filter.as_str())]);
                }
                if let Some(q) = query {
                    request = request.query(&[("query", q)]);
                }
                if let Some(c) = cursor {
                    request = request.query(&[("cursor", c)]);
                }
                let response = request.send().await?.error_for_status()?;
                let payload: ImagesResponse = response.json().await?;
                Ok((payload.items, payload.metadata.cursor_string()))
            }))
            .await
    }

    /// Fetch one page of /api/v1/models filtered to LoRAs with a tag.
    async fn fetch_models_page(
        &self,
        tag: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<ModelItem>, Option<String>)> {
        self.breaker
            .call(retry_async(self.retry, "civitai_models_page", || async move {
                self.limiter.acquire().await;
                let mut request = self
                    .client
                    .get(format!("{}/api/v1/models", self.config.base_url))
                    .query(&[
                        ("types", "LORA"),
                        ("sort", "Newest"),
                        ("limit", "100"),
                        ("tag", tag),
                    ]);
                if let Some(c) = cursor {
                    request = request.query(&[("cursor", c)]);
                }
                let response = request.send().await?.error_for_status()?;
                let payload: ModelsResponse = response.json().await?;
                Ok((payload.items, payload.metadata.cursor_string()))
            }))
            .await
    }

    /// Walk up to `max_pages` of the image feed or a search term. On any
    /// error the cursor reflects the last successful page, so the next tick
    /// resumes rather than skips.
    async fn walk_images(
        &self,
        query: Option<&str>,
        start: Option<String>,
        max_pages: u32,
    ) -> WalkOutcome<ImageItem> {
        let mut items = Vec::new();
        let mut cursor = start;
        let mut circuit_open = false;

        for page in 1..=max_pages {
            match self.fetch_images_page(query, cursor.as_deref()).await {
                Ok((page_items, next_cursor)) => {
                    debug!(query, page, count = page_items.len(), "civitai page fetched");
                    items.extend(page_items);
                    match next_cursor {
                        Some(next) => cursor = Some(next),
                        None => {
                            // Exhausted: restart from the newest page next tick.
                            cursor = None;
                            break;
                        }
                    }
                }
                Err(e) if e.is_circuit_open() => {
                    warn!(query, page, "civitai circuit open during pagination");
                    circuit_open = true;
                    break;
                }
                Err(e) => {
                    warn!(query, page, error = %e, "civitai page error");
                    break;
                }
            }
        }

        WalkOutcome {
            items,
            cursor,
            circuit_open,
        }
    }

    /// Walk up to `max_pages` of LoRA models for one tag, flattening model
    /// version sample images into candidates.
    async fn walk_models(
        &self,
        tag: &str,
        start: Option<String>,
        max_pages: u32,
    ) -> WalkOutcome<Candidate> {
        let mut items = Vec::new();
        let mut cursor = start;
        let mut circuit_open = false;

        for page in 1..=max_pages {
            match self.fetch_models_page(tag, cursor.as_deref()).await {
                Ok((models, next_cursor)) => {
                    for model in &models {
                        let page_url = model
                            .id
                            .map(|id| format!("https://civitai.com/models/{id}"));
                        let title: String = model.name.chars().take(200).collect();
                        for version in &model.model_versions {
                            for img in &version.images {
                                if let Some(url) = &img.url {
                                    items.push(Candidate {
                                        source_url: url.clone(),
                                        page_url: page_url.clone(),
                                        page_title: (!title.is_empty()).then(|| title.clone()),
                                    });
                                }
                            }
                        }
                    }
                    match next_cursor {
                        Some(next) => cursor = Some(next),
                        None => {
                            cursor = None;
                            break;
                        }
                    }
                }
                Err(e) if e.is_circuit_open() => {
                    warn!(tag, page, "civitai circuit open during model browse");
                    circuit_open = true;
                    break;
                }
                Err(e) => {
                    warn!(tag, page, error = %e, "civitai model page error");
                    break;
                }
            }
        }

        WalkOutcome {
            items,
            cursor,
            circuit_open,
        }
    }

    fn image_candidate(item: &ImageItem) -> Option<Candidate> {
        let source_url = item.url.clone()?;
        let page_url = item.id.map(|id| format!("https://civitai.com/images/{id}"));
        let page_title = item
            .meta
            .as_ref()
            .and_then(|m| m.prompt.as_deref())
            .filter(|p| !p.is_empty())
            .map(|p| p.chars().take(200).collect());
        Some(Candidate {
            source_url,
            page_url,
            page_title,
        })
    }

    /// Run the three cursor spaces, returning candidates plus the cursor and
    /// coverage bookkeeping shared by both strategies.
    async fn collect(&self, context: &DiscoveryContext) -> (Vec<Candidate>, DiscoveryResult) {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut result = DiscoveryResult::default();
        let mut circuit_open = false;

        // 1. Paginated global feed (newest images, cursor-resumed), filtered
        //    by face indicators.
        let feed = self
            .walk_images(None, context.cursor.clone(), self.config.max_pages)
            .await;
        candidates.extend(
            feed.items
                .iter()
                .filter(|item| has_face_indicator(item))
                .filter_map(Self::image_candidate),
        );
        result.next_cursor = feed.cursor;
        circuit_open |= feed.circuit_open;

        // 2. Targeted image searches, one cursor per term.
        let saved_search = context.search_cursors.clone().unwrap_or_default();
        let mut search_cursors: HashMap<String, Option<String>> = HashMap::new();
        for term in IMAGE_SEARCH_TERMS.iter() {
            if circuit_open {
                // Not attempted this tick: carry the saved cursor through.
                search_cursors.insert((*term).to_string(), saved_search.get(*term).cloned());
                continue;
            }
            let walk = self
                .walk_images(
                    Some(term),
                    saved_search.get(*term).cloned(),
                    self.config.max_pages,
                )
                .await;
            let found = walk.items.len();
            candidates.extend(walk.items.iter().filter_map(Self::image_candidate));
            search_cursors.insert((*term).to_string(), walk.cursor);
            if found > 0 {
                info!(term, count = found, "civitai image search");
            }
            if walk.circuit_open {
                circuit_open = true;
            }
        }
        result.search_cursors = Some(search_cursors);

        // 3. LoRA model sample images per human-relevant tag.
        let saved_models = context.model_cursors.clone().unwrap_or_default();
        let mut model_cursors: HashMap<String, Option<String>> = HashMap::new();
        for tag in LORA_HUMAN_TAGS.iter() {
            if circuit_open {
                model_cursors.insert((*tag).to_string(), saved_models.get(*tag).cloned());
                continue;
            }
            let walk = self
                .walk_models(
                    tag,
                    saved_models.get(*tag).cloned(),
                    self.config.model_pages_per_tag,
                )
                .await;
            if !walk.items.is_empty() {
                info!(tag, images = walk.items.len(), "civitai lora tag done");
            }
            candidates.extend(walk.items);
            model_cursors.insert((*tag).to_string(), walk.cursor);
            if walk.circuit_open {
                circuit_open = true;
            }
        }
        result.model_cursors = Some(model_cursors);

        result.tags_total = (IMAGE_SEARCH_TERMS.len() + LORA_HUMAN_TAGS.len()) as u32;
        result.tags_exhausted = count_exhausted(&result.search_cursors)
            + count_exhausted(&result.model_cursors);

        (candidates, result)
    }

    /// Two-pass probe for one candidate. Pass 1 detects on the cheap CDN
    /// rendition; only face-positive images download the original for
    /// embedding and thumbnail storage. Unprobeable images come back as
    /// face-negative so they are never reprocessed.
    async fn probe_candidate(
        &self,
        candidate: Candidate,
        detector: &Arc<dyn FaceDetector>,
    ) -> DiscoveredImageResult {
        let mut result = DiscoveredImageResult::new(candidate.source_url.clone(), "civitai");
        result.page_url = candidate.page_url;
        result.page_title = candidate.page_title;
        result.has_face = Some(false);
        result.face_count = Some(0);

        // Pass 1: probe the width-constrained rendition.
        let probe_url = thumbnail_url(&candidate.source_url, self.config.probe_width);
        let probe = match self.downloader.fetch(&probe_url).await {
            Ok(probe) => probe,
            Err(e) => {
                debug!(url = %probe_url, error = %e, "probe download skipped");
                return result;
            }
        };
        let probe_faces = match load_and_resize(&probe.path, RESIZE_TARGET) {
            Ok(img) => detector.detect(&img).await.unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        probe.cleanup().await;
        if probe_faces.is_empty() {
            return result;
        }

        // Pass 2: full-resolution original, re-detect and embed.
        let original = match self.downloader.fetch(&candidate.source_url).await {
            Ok(original) => original,
            Err(e) => {
                debug!(url = %candidate.source_url, error = %e, "original download failed");
                return result;
            }
        };
        let full_image = match load_and_resize(&original.path, RESIZE_TARGET) {
            Ok(img) => img,
            Err(e) => {
                debug!(url = %candidate.source_url, error = %e, "original decode failed");
                original.cleanup().await;
                return result;
            }
        };

        match detector.detect(&full_image).await {
            Ok(faces) if !faces.is_empty() => {
                result.has_face = Some(true);
                result.face_count = Some(faces.len() as i32);
                result.faces = faces
                    .into_iter()
                    .enumerate()
                    .map(|(i, face)| InlineFace {
                        face_index: i as i32,
                        embedding: face.embedding,
                        detection_score: face.detection_score,
                    })
                    .collect();

                if let Some(storage) = &self.storage {
                    match storage.upload_thumbnail(&full_image, "civitai").await {
                        Ok(key) => result.stored_thumbnail_key = Some(key),
                        Err(e) => warn!(error = %e, "thumbnail upload failed"),
                    }
                }
            }
            Ok(_) => {
                // The probe hit was a false positive at full resolution.
            }
            Err(e) => {
                warn!(url = %candidate.source_url, error = %e, "inline detection failed");
            }
        }
        original.cleanup().await;
        result
    }
}

fn count_exhausted(map: &Option<HashMap<String, Option<String>>>) -> u32 {
    map.as_ref()
        .map(|m| m.values().filter(|v| v.is_none()).count() as u32)
        .unwrap_or(0)
}

#[async_trait]
impl DiscoverySource for CivitaiCrawl {
    fn source_type(&self) -> &'static str {
        "platform_crawl"
    }

    fn source_name(&self) -> &'static str {
        "civitai"
    }

    fn detection_strategy(&self) -> DetectionStrategy {
        DetectionStrategy::Inline
    }

    async fn discover(&self, context: &DiscoveryContext) -> Result<DiscoveryResult> {
        let (candidates, mut result) = self.collect(context).await;
        result.images = candidates
            .into_iter()
            .map(|c| {
                let mut image = DiscoveredImageResult::new(c.source_url, "civitai");
                image.page_url = c.page_url;
                image.page_title = c.page_title;
                image
            })
            .collect();
        info!(
            results_found = result.images.len(),
            tags_total = result.tags_total,
            tags_exhausted = result.tags_exhausted,
            "civitai crawl complete"
        );
        Ok(result)
    }

    async fn discover_with_detection(
        &self,
        context: &DiscoveryContext,
        detector: Arc<dyn FaceDetector>,
    ) -> Result<DiscoveryResult> {
        detector.init(None).await?;
        let (candidates, mut result) = self.collect(context).await;

        let mut images = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let image = self.probe_candidate(candidate, &detector).await;
            if image.has_face == Some(true) {
                result.faces_found += image.face_count.unwrap_or(0) as u32;
            }
            images.push(image);
        }
        result.images = images;

        info!(
            results_found = result.images.len(),
            faces_found = result.faces_found,
            tags_exhausted = result.tags_exhausted,
            "civitai inline crawl complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceguard::detector::{DetectedFace, StaticDetector};
    use faceguard::download::TempStore;
    use faceguard::embedding::{l2_normalize, EMBEDDING_DIM};
    use image::{ImageBuffer, Rgb};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jpeg_bytes() -> Vec<u8> {
        let buf = ImageBuffer::from_fn(320, 320, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 40u8])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(buf)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn normalized_embedding() -> Vec<f32> {
        let mut v: Vec<f32> = (0..EMBEDDING_DIM).map(|i| 0.3 + i as f32 * 0.002).collect();
        l2_normalize(&mut v);
        v
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
        }
    }

    fn crawl_against(server: &MockServer, config_overrides: CivitaiConfig) -> CivitaiCrawl {
        let temp =
            TempStore::new(std::env::temp_dir().join("faceguard-civitai-tests")).unwrap();
        let downloader = Arc::new(ImageDownloader::new(temp, None).unwrap());
        CivitaiCrawl::new(
            CivitaiConfig {
                base_url: server.uri(),
                ..config_overrides
            },
            Arc::new(TokenBucket::new(faceguard::ratelimit::RateLimit::new(
                1000.0, 1000.0,
            ))),
            Arc::new(CircuitBreaker::new("civitai")),
            downloader,
            None,
        )
        .unwrap()
        .with_retry_policy(fast_retry())
    }

    fn images_page(urls: &[&str], next_cursor: Option<&str>) -> serde_json::Value {
        json!({
            "items": urls.iter().enumerate().map(|(i, u)| json!({
                "id": i as i64 + 1,
                "url": u,
                "meta": {"prompt": "portrait of a woman"},
                "tags": ["portrait"],
            })).collect::<Vec<_>>(),
            "metadata": {"nextCursor": next_cursor},
        })
    }

    fn empty_models_page() -> serde_json::Value {
        json!({"items": [], "metadata": {}})
    }

    // ========== thumbnail_url ==========

    #[test]
    fn test_thumbnail_url_replaces_original_with_width() {
        let url = "https://image.civitai.com/xG1n/abc123/original=true/def.jpeg";
        assert_eq!(
            thumbnail_url(url, 450),
            "https://image.civitai.com/xG1n/abc123/width=450/def.jpeg"
        );
    }

    #[test]
    fn test_thumbnail_url_custom_width() {
        let url = "https://image.civitai.com/a/original=true/b.jpeg";
        assert_eq!(thumbnail_url(url, 200), "https://image.civitai.com/a/width=200/b.jpeg");
    }

    #[test]
    fn test_thumbnail_url_without_marker_unchanged() {
        let url = "https://image.civitai.com/a/width=1024/b.jpeg";
        assert_eq!(thumbnail_url(url, 450), url);
    }

    #[test]
    fn test_thumbnail_url_preserves_query_params() {
        let url = "https://image.civitai.com/a/original=true/b.jpeg?token=xyz";
        let result = thumbnail_url(url, 450);
        assert!(result.contains("/width=450/"));
        assert!(result.ends_with("?token=xyz"));
    }

    // ========== face indicator filter ==========

    #[test]
    fn test_face_indicator_matches_prompt() {
        let item = ImageItem {
            id: Some(1),
            url: Some("u".to_string()),
            meta: Some(ImageMeta {
                prompt: Some("A photorealistic portrait".to_string()),
            }),
            tags: vec![json!("landscape")],
        };
        assert!(has_face_indicator(&item));
    }

    #[test]
    fn test_face_indicator_matches_tags() {
        let item = ImageItem {
            id: Some(1),
            url: Some("u".to_string()),
            meta: None,
            tags: vec![json!("selfie")],
        };
        assert!(has_face_indicator(&item));
    }

    #[test]
    fn test_face_indicator_untagged_kept() {
        let item = ImageItem {
            id: Some(1),
            url: Some("u".to_string()),
            meta: None,
            tags: vec![],
        };
        assert!(has_face_indicator(&item));
    }

    #[test]
    fn test_face_indicator_rejects_landscape() {
        let item = ImageItem {
            id: Some(1),
            url: Some("u".to_string()),
            meta: Some(ImageMeta {
                prompt: Some("mountain landscape at dusk".to_string()),
            }),
            tags: vec![json!("scenery")],
        };
        assert!(!has_face_indicator(&item));
    }

    // ========== cursor metadata ==========

    #[test]
    fn test_cursor_string_accepts_numbers_and_strings() {
        let m: PageMetadata = serde_json::from_value(json!({"nextCursor": "abc"})).unwrap();
        assert_eq!(m.cursor_string().as_deref(), Some("abc"));
        let m: PageMetadata = serde_json::from_value(json!({"nextCursor": 12345})).unwrap();
        assert_eq!(m.cursor_string().as_deref(), Some("12345"));
        let m: PageMetadata = serde_json::from_value(json!({})).unwrap();
        assert_eq!(m.cursor_string(), None);
        let m: PageMetadata = serde_json::from_value(json!({"nextCursor": null})).unwrap();
        assert_eq!(m.cursor_string(), None);
    }

    // ========== deferred discover ==========

    #[tokio::test]
    async fn test_discover_collects_feed_and_cursors() {
        let server = MockServer::start().await;
        // Feed page with a continuation cursor.
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(images_page(
                &["https://img.example/a.jpg", "https://img.example/b.jpg"],
                Some("cursor-2"),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_models_page()))
            .mount(&server)
            .await;

        let crawl = crawl_against(&server, CivitaiConfig::default());
        let result = crawl.discover(&DiscoveryContext::default()).await.unwrap();

        // Feed + 8 search terms each returned both URLs, deduped downstream
        // by the URL-hash index.
        assert!(!result.images.is_empty());
        assert_eq!(result.next_cursor.as_deref(), Some("cursor-2"));
        assert_eq!(result.tags_total, 17);
        let search = result.search_cursors.as_ref().unwrap();
        assert_eq!(search.len(), IMAGE_SEARCH_TERMS.len());
        assert!(search.values().all(|c| c.as_deref() == Some("cursor-2")));
        // Model tags all exhausted (empty pages, no cursor).
        assert_eq!(
            count_exhausted(&result.model_cursors),
            LORA_HUMAN_TAGS.len() as u32
        );
    }

    #[tokio::test]
    async fn test_discover_term_exhaustion_clears_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(images_page(&["https://img.example/a.jpg"], None)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_models_page()))
            .mount(&server)
            .await;

        let crawl = crawl_against(&server, CivitaiConfig::default());
        let result = crawl.discover(&DiscoveryContext::default()).await.unwrap();

        assert_eq!(result.next_cursor, None);
        let search = result.search_cursors.as_ref().unwrap();
        assert!(search.values().all(Option::is_none));
        assert_eq!(result.tags_exhausted, result.tags_total);
    }

    #[tokio::test]
    async fn test_discover_resumes_from_saved_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .and(query_param("cursor", "resume-here"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(images_page(&["https://img.example/next.jpg"], None)),
            )
            .expect(1..)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(images_page(&[], None)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_models_page()))
            .mount(&server)
            .await;

        let crawl = crawl_against(&server, CivitaiConfig::default());
        let context = DiscoveryContext {
            cursor: Some("resume-here".to_string()),
            ..DiscoveryContext::default()
        };
        let result = crawl.discover(&context).await.unwrap();
        assert!(result
            .images
            .iter()
            .any(|i| i.source_url == "https://img.example/next.jpg"));
    }

    #[tokio::test]
    async fn test_circuit_open_preserves_saved_cursors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let temp = TempStore::new(dir.path().join("scratch")).unwrap();
        let downloader = Arc::new(ImageDownloader::new(temp, None).unwrap());
        // Threshold 1: the first feed failure opens the circuit.
        let crawl = CivitaiCrawl::new(
            CivitaiConfig {
                base_url: server.uri(),
                ..CivitaiConfig::default()
            },
            Arc::new(TokenBucket::new(faceguard::ratelimit::RateLimit::new(
                1000.0, 1000.0,
            ))),
            Arc::new(CircuitBreaker::with_settings(
                "civitai",
                1,
                Duration::from_secs(60),
            )),
            downloader,
            None,
        )
        .unwrap()
        .with_retry_policy(fast_retry());

        let context = DiscoveryContext {
            cursor: Some("feed-cursor".to_string()),
            search_cursors: Some(HashMap::from([
                ("woman".to_string(), "saved-woman".to_string()),
                ("portrait".to_string(), "saved-portrait".to_string()),
            ])),
            ..DiscoveryContext::default()
        };
        let result = crawl.discover(&context).await.unwrap();

        // All saved term cursors survive the aborted tick unchanged.
        let search = result.search_cursors.as_ref().unwrap();
        assert_eq!(
            search.get("woman").cloned().flatten().as_deref(),
            Some("saved-woman")
        );
        assert_eq!(
            search.get("portrait").cloned().flatten().as_deref(),
            Some("saved-portrait")
        );
        assert!(result.images.is_empty());
    }

    // ========== inline two-pass detection ==========

    #[tokio::test]
    async fn test_inline_two_pass_probe_and_embed() {
        let server = MockServer::start().await;
        let source_url = format!("{}/cdn/original=true/face.jpeg", server.uri());

        // One feed item, empty search/model pages.
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .and(query_param("query", "woman"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 7, "url": source_url, "meta": {"prompt": "portrait"}, "tags": []}],
                "metadata": {},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [],
                "metadata": {},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_models_page()))
            .mount(&server)
            .await;
        // Pass 1 probe rendition and pass 2 original.
        Mock::given(method("GET"))
            .and(path("/cdn/width=450/face.jpeg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(jpeg_bytes()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/original=true/face.jpeg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(jpeg_bytes()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let crawl = crawl_against(&server, CivitaiConfig::default());
        let face = DetectedFace::new(normalized_embedding(), 0.93).unwrap();
        let detector: Arc<dyn FaceDetector> = Arc::new(StaticDetector::with_faces(vec![face]));

        let result = crawl
            .discover_with_detection(&DiscoveryContext::default(), detector)
            .await
            .unwrap();

        let hit = result
            .images
            .iter()
            .find(|i| i.source_url == source_url)
            .unwrap();
        assert_eq!(hit.has_face, Some(true));
        assert_eq!(hit.face_count, Some(1));
        assert_eq!(hit.faces.len(), 1);
        assert_eq!(hit.faces[0].face_index, 0);
        assert_eq!(hit.faces[0].embedding.len(), EMBEDDING_DIM);
        assert!(result.faces_found >= 1);
    }

    #[tokio::test]
    async fn test_inline_no_face_skips_original_download() {
        let server = MockServer::start().await;
        let source_url = format!("{}/cdn/original=true/empty.jpeg", server.uri());

        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .and(query_param("query", "woman"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 9, "url": source_url, "meta": null, "tags": []}],
                "metadata": {},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [],
                "metadata": {},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_models_page()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/width=450/empty.jpeg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(jpeg_bytes()),
            )
            .mount(&server)
            .await;
        // The original rendition must never be requested.
        Mock::given(method("GET"))
            .and(path("/cdn/original=true/empty.jpeg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let crawl = crawl_against(&server, CivitaiConfig::default());
        let detector: Arc<dyn FaceDetector> = Arc::new(StaticDetector::empty());

        let result = crawl
            .discover_with_detection(&DiscoveryContext::default(), detector)
            .await
            .unwrap();

        let miss = result
            .images
            .iter()
            .find(|i| i.source_url == source_url)
            .unwrap();
        assert_eq!(miss.has_face, Some(false));
        assert_eq!(miss.face_count, Some(0));
        assert!(miss.faces.is_empty());
        assert_eq!(result.faces_found, 0);
    }
}
