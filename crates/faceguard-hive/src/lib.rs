//! # faceguard-hive
//!
//! Hive AI-generation classification client. For medium-or-better matches
//! on paid tiers, the stored thumbnail URL goes to the classifier and the
//! verdict (AI-generated flag, score, suspected generator) lands on the
//! match row.
//!
//! Classifier failures never block the pipeline: a failed call simply
//! leaves the match unclassified.

use std::sync::Arc;
use std::time::Duration;

use faceguard::error::{Error, Result};
use faceguard::ratelimit::TokenBucket;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// Verdict from the AI-generation classifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AiClassification {
    pub is_ai_generated: bool,
    pub score: f64,
    #[serde(default)]
    pub generator: Option<String>,
}

/// Hive moderation API client.
pub struct HiveClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<TokenBucket>,
}

impl HiveClient {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the API key is missing, or an
    /// HTTP error if the client cannot be built.
    pub fn new(base_url: &str, api_key: &str, limiter: Arc<TokenBucket>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::config("hive_api_key is required"));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter,
        })
    }

    /// Classify an image URL. Returns `None` on any provider failure — the
    /// match is stored without a verdict rather than blocking the tick.
    pub async fn classify(&self, image_url: &str) -> Option<AiClassification> {
        self.limiter.acquire().await;

        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "image_url": image_url }))
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "ai classification rejected");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "ai classification request failed");
                return None;
            }
        };

        match response.json::<AiClassification>().await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "ai classification response unparseable");
                None
            }
        }
    }
}
