//! URL-check discovery: user-submitted pages scanned for images.
//!
//! Available on paid tiers; the administrative surface owns the submission
//! flow and hands URLs in through the discovery context. Direct image URLs
//! pass straight through; HTML pages are parsed for `img[src]` and
//! `og:image` references.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use faceguard::discovery::{
    DiscoveredImageResult, DiscoveryContext, DiscoveryResult, DiscoverySource,
};
use faceguard::error::Result;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

/// Fetch timeout per submitted URL.
const PAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// URL-check discovery source.
pub struct UrlCheckDiscovery {
    client: reqwest::Client,
}

impl UrlCheckDiscovery {
    /// Build the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(PAGE_TIMEOUT)
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
        })
    }

    async fn check_url(&self, page_url: &str) -> Vec<DiscoveredImageResult> {
        let response = match self.client.get(page_url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(url = page_url, status = %response.status(), "url check non-2xx");
                return Vec::new();
            }
            Err(e) => {
                debug!(url = page_url, error = %e, "url check fetch error");
                return Vec::new();
            }
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // A direct image link is its own result.
        if content_type.starts_with("image/") {
            let mut image = DiscoveredImageResult::new(page_url, "url_check");
            image.page_url = Some(page_url.to_string());
            return vec![image];
        }

        let Ok(html) = response.text().await else {
            return Vec::new();
        };
        extract_page_images(page_url, &html)
    }
}

/// Parse an HTML page for candidate image URLs, resolving relative
/// references and skipping icons, SVGs, and data URIs.
pub(crate) fn extract_page_images(page_url: &str, html: &str) -> Vec<DiscoveredImageResult> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        })
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(200).collect::<String>());

    // BTreeSet for stable output order and in-page dedup.
    let mut candidates: BTreeSet<String> = BTreeSet::new();

    if let Ok(selector) = Selector::parse("img[src]") {
        for element in document.select(&selector) {
            if let Some(src) = element.value().attr("src") {
                candidates.insert(src.to_string());
            }
        }
    }
    if let Ok(selector) = Selector::parse(r#"meta[property="og:image"]"#) {
        for element in document.select(&selector) {
            if let Some(content) = element.value().attr("content") {
                candidates.insert(content.to_string());
            }
        }
    }

    candidates
        .into_iter()
        .filter_map(|raw| {
            let resolved = match (&base, Url::parse(&raw)) {
                (_, Ok(absolute)) => absolute.to_string(),
                (Some(base), Err(_)) => base.join(&raw).ok()?.to_string(),
                (None, Err(_)) => return None,
            };
            let lowered = resolved.to_lowercase();
            let file_name = lowered.rsplit('/').next().unwrap_or("");
            if lowered.starts_with("data:")
                || lowered.ends_with(".svg")
                || lowered.contains("favicon")
                || file_name.contains("icon")
            {
                return None;
            }
            let mut image = DiscoveredImageResult::new(resolved, "url_check");
            image.page_url = Some(page_url.to_string());
            image.page_title = title.clone();
            Some(image)
        })
        .collect()
}

#[async_trait]
impl DiscoverySource for UrlCheckDiscovery {
    fn source_type(&self) -> &'static str {
        "url_check"
    }

    fn source_name(&self) -> &'static str {
        "url_check"
    }

    async fn discover(&self, context: &DiscoveryContext) -> Result<DiscoveryResult> {
        let mut images = Vec::new();
        for url in &context.urls {
            images.extend(self.check_url(url).await);
        }
        info!(
            urls_checked = context.urls.len(),
            images_found = images.len(),
            "url check complete"
        );
        Ok(DiscoveryResult {
            images,
            ..DiscoveryResult::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"
        <html>
          <head>
            <title>Gallery of portraits</title>
            <meta property="og:image" content="https://cdn.example.com/og-hero.jpg" />
          </head>
          <body>
            <img src="/photos/portrait1.jpg" />
            <img src="https://cdn.example.com/portrait2.png" />
            <img src="/assets/favicon.png" />
            <img src="/logo-icon.png" />
            <img src="/diagram.svg" />
            <img src="data:image/png;base64,AAAA" />
          </body>
        </html>
    "#;

    #[test]
    fn test_extract_resolves_relative_urls() {
        let images = extract_page_images("https://gallery.example.com/page", PAGE);
        let urls: Vec<&str> = images.iter().map(|i| i.source_url.as_str()).collect();
        assert!(urls.contains(&"https://gallery.example.com/photos/portrait1.jpg"));
        assert!(urls.contains(&"https://cdn.example.com/portrait2.png"));
        assert!(urls.contains(&"https://cdn.example.com/og-hero.jpg"));
    }

    #[test]
    fn test_extract_skips_icons_svg_and_data_uris() {
        let images = extract_page_images("https://gallery.example.com/page", PAGE);
        for image in &images {
            let url = image.source_url.to_lowercase();
            assert!(!url.contains("favicon"), "{url}");
            assert!(!url.ends_with(".svg"), "{url}");
            assert!(!url.starts_with("data:"), "{url}");
            assert!(!url.contains("logo-icon"), "{url}");
        }
    }

    #[test]
    fn test_extract_captures_title_and_page_url() {
        let images = extract_page_images("https://gallery.example.com/page", PAGE);
        assert!(!images.is_empty());
        for image in &images {
            assert_eq!(image.page_title.as_deref(), Some("Gallery of portraits"));
            assert_eq!(
                image.page_url.as_deref(),
                Some("https://gallery.example.com/page")
            );
        }
    }

    #[test]
    fn test_extract_dedupes_repeated_sources() {
        let html = r#"<img src="/a.jpg" /><img src="/a.jpg" />"#;
        let images = extract_page_images("https://x.example.com/", html);
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_direct_image_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/direct.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xFF, 0xD8, 0xFF]),
            )
            .mount(&server)
            .await;

        let source = UrlCheckDiscovery::new().unwrap();
        let context = DiscoveryContext {
            urls: vec![format!("{}/direct.jpg", server.uri())],
            ..DiscoveryContext::default()
        };
        let result = source.discover(&context).await.unwrap();
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].platform, "url_check");
    }

    #[tokio::test]
    async fn test_discover_html_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gallery"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(PAGE),
            )
            .mount(&server)
            .await;

        let source = UrlCheckDiscovery::new().unwrap();
        let context = DiscoveryContext {
            urls: vec![format!("{}/gallery", server.uri())],
            ..DiscoveryContext::default()
        };
        let result = source.discover(&context).await.unwrap();
        assert!(result.images.len() >= 3);
    }

    #[tokio::test]
    async fn test_discover_unreachable_url_is_empty() {
        let source = UrlCheckDiscovery::new().unwrap();
        let context = DiscoveryContext {
            urls: vec!["http://127.0.0.1:1/nothing".to_string()],
            ..DiscoveryContext::default()
        };
        let result = source.discover(&context).await.unwrap();
        assert!(result.images.is_empty());
    }
}
