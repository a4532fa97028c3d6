//! Discovery-source abstraction implemented by platform providers.
//!
//! A provider either returns URL metadata only (DEFERRED — detection runs
//! later in the subprocess worker) or downloads and detects during the crawl
//! (INLINE — rows arrive already annotated with faces). The core dispatches
//! uniformly on [`DetectionStrategy`]; no platform-specific branching.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::FaceDetector;
use crate::error::{Error, Result};
use crate::types::Tier;

/// How a provider handles face detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStrategy {
    /// Provider downloads and detects during the crawl.
    Inline,
    /// Provider returns URL metadata; detection is a later pipeline stage.
    Deferred,
}

impl DetectionStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Deferred => "deferred",
        }
    }
}

/// Inputs to a discovery run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryContext {
    /// Platform being crawled (platform crawls only).
    pub platform: Option<String>,
    /// Effective search terms, possibly overridden by the taxonomy mapper.
    pub search_terms: Option<Vec<String>>,
    /// Global feed cursor.
    pub cursor: Option<String>,
    /// Per-search-term resume tokens.
    pub search_cursors: Option<HashMap<String, String>>,
    /// Per-tag resume tokens (tag-browse cursor space).
    pub model_cursors: Option<HashMap<String, String>>,
    /// Per-tag page-depth overrides from the damage-tier categorization.
    pub tag_depths: Option<HashMap<String, u32>>,
    /// Target contributor (reverse-image scans only).
    pub contributor_id: Option<Uuid>,
    /// Target contributor's tier (reverse-image scans only).
    pub contributor_tier: Tier,
    /// Reference images as (bucket, path) pairs (reverse-image scans only).
    pub images: Vec<(String, String)>,
    /// User-submitted URLs (URL checks only).
    pub urls: Vec<String>,
}

/// One face detected inline by an INLINE provider.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFace {
    pub face_index: i32,
    pub embedding: Vec<f32>,
    pub detection_score: f32,
}

/// One image surfaced by a discovery run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredImageResult {
    pub source_url: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub platform: String,
    /// Storage key of the provider-uploaded thumbnail, when present. The
    /// provider's upload is authoritative; downstream stages never re-upload.
    pub stored_thumbnail_key: Option<String>,
    /// INLINE providers: whether the image contains faces.
    pub has_face: Option<bool>,
    /// INLINE providers: detected face count.
    pub face_count: Option<i32>,
    /// INLINE providers: one entry per detected face.
    pub faces: Vec<InlineFace>,
}

impl DiscoveredImageResult {
    #[must_use]
    pub fn new(source_url: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            platform: platform.into(),
            ..Self::default()
        }
    }
}

/// Output of one discovery run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub images: Vec<DiscoveredImageResult>,
    /// Global feed cursor to resume from; None = feed exhausted.
    pub next_cursor: Option<String>,
    /// Per-term cursors; a None value marks the term exhausted this tick.
    pub search_cursors: Option<HashMap<String, Option<String>>>,
    /// Per-tag cursors, same shape as `search_cursors`.
    pub model_cursors: Option<HashMap<String, Option<String>>>,
    /// Terms/tags attempted this tick.
    pub tags_total: u32,
    /// Terms/tags that ran out of pages this tick.
    pub tags_exhausted: u32,
    /// Faces found (INLINE providers).
    pub faces_found: u32,
}

/// Persisted per-platform cursor blob (opaque JSON in the crawl schedule).
///
/// Exhausted entries (None in the result maps) are counted into coverage
/// stats by the provider and then dropped here, so the term restarts from
/// the newest page on the next tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_cursors: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cursors: Option<HashMap<String, String>>,
}

impl CursorState {
    /// Parse the stored JSON blob; unknown or malformed blobs reset to empty.
    #[must_use]
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Serialize for persistence.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Merge a discovery result into this cursor state.
    ///
    /// Keys whose new value is exhausted (None) are dropped; a map with no
    /// live entries left is removed entirely so the next tick restarts from
    /// the newest page.
    pub fn apply(&mut self, result: &DiscoveryResult) {
        self.cursor = result.next_cursor.clone();

        self.search_cursors = result
            .search_cursors
            .as_ref()
            .map(compact_cursor_map)
            .filter(|m| !m.is_empty());
        self.model_cursors = result
            .model_cursors
            .as_ref()
            .map(compact_cursor_map)
            .filter(|m| !m.is_empty());
    }

    /// Hydrate a [`DiscoveryContext`] from this saved state.
    #[must_use]
    pub fn to_context(&self, platform: &str) -> DiscoveryContext {
        DiscoveryContext {
            platform: Some(platform.to_string()),
            cursor: self.cursor.clone(),
            search_cursors: self.search_cursors.clone(),
            model_cursors: self.model_cursors.clone(),
            ..DiscoveryContext::default()
        }
    }
}

fn compact_cursor_map(map: &HashMap<String, Option<String>>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| v.as_ref().map(|c| (k.clone(), c.clone())))
        .collect()
}

/// A source of discovered images: platform crawl, reverse-image search, or
/// URL check.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Source category, e.g. `platform_crawl` or `reverse_image`.
    fn source_type(&self) -> &'static str;

    /// Stable source name, e.g. `civitai`.
    fn source_name(&self) -> &'static str;

    /// Whether this source detects faces during the crawl.
    fn detection_strategy(&self) -> DetectionStrategy {
        DetectionStrategy::Deferred
    }

    /// Discover image URLs (DEFERRED path).
    async fn discover(&self, context: &DiscoveryContext) -> Result<DiscoveryResult>;

    /// Discover and detect in one pass (INLINE path).
    async fn discover_with_detection(
        &self,
        context: &DiscoveryContext,
        detector: Arc<dyn FaceDetector>,
    ) -> Result<DiscoveryResult> {
        let _ = (context, detector);
        Err(Error::provider(format!(
            "{} does not support inline detection",
            self.source_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_cursors(
        next: Option<&str>,
        search: &[(&str, Option<&str>)],
    ) -> DiscoveryResult {
        DiscoveryResult {
            next_cursor: next.map(String::from),
            search_cursors: Some(
                search
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.map(String::from)))
                    .collect(),
            ),
            ..DiscoveryResult::default()
        }
    }

    #[test]
    fn test_cursor_state_round_trip() {
        let mut state = CursorState::default();
        state.apply(&result_with_cursors(
            Some("feed-123"),
            &[("woman", Some("c1")), ("portrait", Some("c2"))],
        ));

        let json = state.to_json().unwrap();
        let back = CursorState::from_json(Some(&json));
        assert_eq!(back, state);
        assert_eq!(back.cursor.as_deref(), Some("feed-123"));
        assert_eq!(
            back.search_cursors.as_ref().unwrap().get("woman").map(String::as_str),
            Some("c1")
        );
    }

    #[test]
    fn test_cursor_apply_drops_exhausted_terms() {
        let mut state = CursorState::default();
        state.apply(&result_with_cursors(
            None,
            &[("woman", Some("c1")), ("portrait", None)],
        ));

        let map = state.search_cursors.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("woman"));
        assert!(!map.contains_key("portrait"));
    }

    #[test]
    fn test_cursor_apply_removes_empty_map() {
        let mut state = CursorState::default();
        state.apply(&result_with_cursors(None, &[("woman", Some("c1"))]));
        assert!(state.search_cursors.is_some());

        // All terms exhausted: the whole map disappears so every term
        // restarts from the newest page next tick.
        state.apply(&result_with_cursors(None, &[("woman", None)]));
        assert!(state.search_cursors.is_none());
    }

    #[test]
    fn test_cursor_apply_clears_feed_cursor_on_exhaustion() {
        let mut state = CursorState {
            cursor: Some("old".to_string()),
            ..CursorState::default()
        };
        state.apply(&DiscoveryResult::default());
        assert!(state.cursor.is_none());
    }

    #[test]
    fn test_cursor_from_malformed_json_resets() {
        let bad = serde_json::json!(["not", "an", "object"]);
        let state = CursorState::from_json(Some(&bad));
        assert_eq!(state, CursorState::default());
        assert_eq!(CursorState::from_json(None), CursorState::default());
    }

    #[test]
    fn test_cursor_to_context() {
        let state = CursorState {
            cursor: Some("abc".to_string()),
            search_cursors: Some(HashMap::from([("t".to_string(), "c".to_string())])),
            model_cursors: None,
        };
        let ctx = state.to_context("civitai");
        assert_eq!(ctx.platform.as_deref(), Some("civitai"));
        assert_eq!(ctx.cursor.as_deref(), Some("abc"));
        assert!(ctx.search_cursors.is_some());
        assert!(ctx.model_cursors.is_none());
    }

    #[test]
    fn test_detection_strategy_names() {
        assert_eq!(DetectionStrategy::Inline.as_str(), "inline");
        assert_eq!(DetectionStrategy::Deferred.as_str(), "deferred");
    }

    #[test]
    fn test_serialized_state_omits_empty_spaces() {
        let state = CursorState {
            cursor: Some("x".to_string()),
            search_cursors: None,
            model_cursors: None,
        };
        let json = state.to_json().unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("cursor"));
        assert!(!obj.contains_key("search_cursors"));
        assert!(!obj.contains_key("model_cursors"));
    }
}
