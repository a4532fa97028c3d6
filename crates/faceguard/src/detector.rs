//! Face-detection provider interface.
//!
//! The model runtime (neural-network weights, inference) is an external
//! collaborator; the pipeline only depends on this seam. One provider is
//! initialized per process — the deferred-detection worker spawns a child
//! process per chunk specifically so the model's memory is reclaimed when
//! the child exits.

use async_trait::async_trait;
use image::DynamicImage;

use crate::embedding::{is_valid_embedding, EMBEDDING_DIM};
use crate::error::{Error, Result};

/// One detected face: a normalized 512-dim embedding plus detection score.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    pub detection_score: f32,
}

impl DetectedFace {
    /// Build a face, validating the embedding contract.
    ///
    /// # Errors
    ///
    /// Returns an error unless the embedding is 512-dim and L2-normalized.
    pub fn new(embedding: Vec<f32>, detection_score: f32) -> Result<Self> {
        if !is_valid_embedding(&embedding) {
            return Err(Error::Detection(format!(
                "embedding must be {EMBEDDING_DIM}-dim and L2-normalized (got {} dims)",
                embedding.len()
            )));
        }
        Ok(Self {
            embedding,
            detection_score,
        })
    }
}

/// A face-detection provider.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Initialize the model. Called once per process before any detection.
    async fn init(&self, model_name: Option<&str>) -> Result<()>;

    /// Detect faces in a decoded image, returning one entry per face.
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Deterministic detector for tests: returns a fixed face list for every
/// image. Lives in non-test code so downstream crates' tests can share it.
#[derive(Debug, Default)]
pub struct StaticDetector {
    faces: Vec<DetectedFace>,
}

impl StaticDetector {
    /// Detector that finds no faces.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Detector that reports the given faces for every image.
    #[must_use]
    pub fn with_faces(faces: Vec<DetectedFace>) -> Self {
        Self { faces }
    }
}

#[async_trait]
impl FaceDetector for StaticDetector {
    async fn init(&self, _model_name: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn detect(&self, _image: &DynamicImage) -> Result<Vec<DetectedFace>> {
        Ok(self.faces.clone())
    }
}
