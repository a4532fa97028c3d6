//! Face-detection provider wiring.
//!
//! The model runtime is an external collaborator: a detection sidecar that
//! loads the network weights once per process and answers over HTTP. The
//! scanner never links the weights itself — the deferred worker's
//! child-process isolation bounds the *sidecar client* state, and the
//! sidecar owns the model memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faceguard::config::Config;
use faceguard::detector::{DetectedFace, FaceDetector};
use faceguard::error::{Error, Result};
use image::DynamicImage;
use serde::Deserialize;
use tracing::debug;

/// Build the configured face-detection provider.
///
/// # Errors
///
/// Returns a configuration error for unknown provider names or a missing
/// service URL.
pub fn build_detector(config: &Config) -> Result<Arc<dyn FaceDetector>> {
    match config.face_detection_provider.as_str() {
        "insightface" => Ok(Arc::new(HttpFaceDetector::new(
            &config.face_detection_service_url,
        )?)),
        other => Err(Error::config(format!(
            "unknown face_detection_provider: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<SidecarFace>,
}

#[derive(Debug, Deserialize)]
struct SidecarFace {
    embedding: Vec<f32>,
    detection_score: f32,
}

/// Detector speaking to an InsightFace sidecar over HTTP.
///
/// Protocol: `POST /init {"model": name}` once per process, then
/// `POST /detect` with JPEG bytes returning
/// `{"faces": [{"embedding": [...512], "detection_score": s}]}`.
pub struct HttpFaceDetector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFaceDetector {
    /// Build the sidecar client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the service URL is missing.
    pub fn new(base_url: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(Error::config("face_detection_service_url is required"));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
        let mut out = std::io::Cursor::new(Vec::new());
        image
            .to_rgb8()
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(|e| Error::Detection(format!("image encode failed: {e}")))?;
        Ok(out.into_inner())
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn init(&self, model_name: Option<&str>) -> Result<()> {
        let model = model_name.unwrap_or("buffalo_sc");
        self.client
            .post(format!("{}/init", self.base_url))
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Detection(format!("model init failed: {e}")))?;
        debug!(model, "face detection model initialized");
        Ok(())
    }

    async fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let bytes = Self::encode_jpeg(image)?;
        let response = self
            .client
            .post(format!("{}/detect", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Detection(format!("detection call failed: {e}")))?;

        let payload: DetectResponse = response
            .json()
            .await
            .map_err(|e| Error::Detection(format!("detection response unparseable: {e}")))?;

        payload
            .faces
            .into_iter()
            .map(|face| DetectedFace::new(face.embedding, face.detection_score))
            .collect()
    }
}
