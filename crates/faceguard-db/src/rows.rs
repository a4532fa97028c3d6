//! Typed row structs returned by the data store adapter.

use chrono::{DateTime, Utc};
use faceguard::types::Tier;
use uuid::Uuid;

/// A contributor row (read-only; owned by the web application).
#[derive(Debug, Clone)]
pub struct ContributorRow {
    pub id: Uuid,
    pub subscription_tier: String,
    pub opted_out: bool,
    pub suspended: bool,
}

impl ContributorRow {
    #[must_use]
    pub fn tier(&self) -> Tier {
        Tier::from_name(&self.subscription_tier)
    }
}

/// A pending reference image awaiting embedding.
#[derive(Debug, Clone)]
pub struct PendingReferenceImage {
    pub id: Uuid,
    pub contributor_id: Uuid,
    pub bucket: Option<String>,
    pub file_path: Option<String>,
    pub capture_step: Option<String>,
}

/// A registry identity whose selfie awaits embedding.
#[derive(Debug, Clone)]
pub struct PendingRegistrySelfie {
    pub cid: String,
    pub selfie_bucket: Option<String>,
    pub selfie_path: Option<String>,
}

/// A stored single embedding, for centroid recomputation.
#[derive(Debug, Clone)]
pub struct SingleEmbeddingRow {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub detection_score: Option<f64>,
}

/// A contributor's best embedding (centroid preferred), for backfill.
#[derive(Debug, Clone)]
pub struct BestEmbeddingRow {
    pub id: Uuid,
    pub vector: Vec<f32>,
}

/// A due per-contributor scan.
#[derive(Debug, Clone)]
pub struct DueScan {
    pub contributor_id: Uuid,
    pub scan_type: String,
    pub interval_hours: i32,
    pub priority: i32,
}

/// A due platform crawl.
#[derive(Debug, Clone)]
pub struct DueCrawl {
    pub platform: String,
    pub cursor_blob: Option<serde_json::Value>,
}

/// A discovered image pending face detection.
#[derive(Debug, Clone)]
pub struct PendingDetectionImage {
    pub id: Uuid,
    pub source_url: String,
}

/// A face embedding not yet compared against the registry.
#[derive(Debug, Clone)]
pub struct UnmatchedEmbedding {
    pub id: Uuid,
    pub embedding: Vec<f32>,
    pub discovered_image_id: Uuid,
    pub face_index: i32,
    pub page_url: Option<String>,
}

/// Identity side of a similarity hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchIdentity {
    Contributor(Uuid),
    Registry(String),
}

/// One row from the combined contributor + registry similarity query.
#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub identity: MatchIdentity,
    /// Best contributor-embedding id; None for registry hits.
    pub embedding_id: Option<Uuid>,
    pub similarity: f64,
}

/// One backfill hit against stored discovered-face embeddings.
#[derive(Debug, Clone)]
pub struct BackfillHit {
    pub discovered_image_id: Uuid,
    pub face_index: i32,
    pub similarity: f64,
}

/// Source fields needed by post-match actions.
#[derive(Debug, Clone)]
pub struct DiscoveredImageInfo {
    pub source_url: String,
    pub platform: Option<String>,
    pub stored_thumbnail_key: Option<String>,
}

/// Row counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub no_face_images: u64,
    pub unmatched_images: u64,
    pub face_embeddings: u64,
    pub finished_jobs: u64,
    pub read_notifications: u64,
}

impl CleanupCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.no_face_images
            + self.unmatched_images
            + self.face_embeddings
            + self.finished_jobs
            + self.read_notifications
    }
}

/// Operational metrics snapshot, logged periodically.
#[derive(Debug, Clone, Default)]
pub struct ScannerMetrics {
    pub embeddings_pending: i64,
    pub embeddings_processed_24h: i64,
    pub scans_completed_24h: i64,
    pub scans_failed_24h: i64,
    pub images_discovered_24h: i64,
    pub images_with_faces_24h: i64,
    pub matches_found_24h: i64,
    pub matches_known_account_24h: i64,
    pub evidence_captured_24h: i64,
    pub contributors_in_registry: i64,
    pub registry_identities_with_embedding: i64,
    pub registry_matches_24h: i64,
}

/// A scan job's summary state, used by tests and the admin surface.
#[derive(Debug, Clone)]
pub struct ScanJobRow {
    pub id: Uuid,
    pub scan_type: String,
    pub status: String,
    pub source_name: Option<String>,
    pub images_processed: i32,
    pub matches_found: i32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contributor_row_tier() {
        let row = ContributorRow {
            id: Uuid::new_v4(),
            subscription_tier: "premium".to_string(),
            opted_out: false,
            suspended: false,
        };
        assert_eq!(row.tier(), Tier::Premium);
    }

    #[test]
    fn test_contributor_row_unknown_tier_is_free() {
        let row = ContributorRow {
            id: Uuid::new_v4(),
            subscription_tier: "vip".to_string(),
            opted_out: false,
            suspended: false,
        };
        assert_eq!(row.tier(), Tier::Free);
    }

    #[test]
    fn test_cleanup_counts_total() {
        let counts = CleanupCounts {
            no_face_images: 10,
            unmatched_images: 5,
            face_embeddings: 3,
            finished_jobs: 2,
            read_notifications: 1,
        };
        assert_eq!(counts.total(), 21);
    }
}
