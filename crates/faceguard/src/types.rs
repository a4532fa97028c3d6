//! Domain types shared by the scanner pipeline.
//!
//! These mirror the shared database schema: the web application owns
//! contributor rows, the scanner owns discovery, embedding, and match rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier of a contributor. Unknown values map to [`Tier::Free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tier {
    #[default]
    Free,
    Protected,
    Premium,
}

impl Tier {
    /// Parse a tier name; anything unrecognized is treated as free.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "protected" => Self::Protected,
            "premium" => Self::Premium,
            _ => Self::Free,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Protected => "protected",
            Self::Premium => "premium",
        }
    }

    /// Scan-schedule priority derived from the tier.
    #[must_use]
    pub fn scan_priority(&self) -> i32 {
        match self {
            Self::Premium => 2,
            Self::Protected => 1,
            Self::Free => 0,
        }
    }

    /// Whether this is a paying tier.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Lifecycle of a reference image or registry selfie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingStatus {
    Pending,
    Processed,
    Failed,
    Skipped,
}

impl EmbeddingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Kind of a stored contributor embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Single,
    Centroid,
}

impl EmbeddingKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Centroid => "centroid",
        }
    }
}

/// Lifecycle of a scan or crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Face-detection state of a discovered image.
///
/// The database stores this as a nullable boolean plus a count; NULL means
/// detection has not run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceProbe {
    /// Detection has not run on this image.
    #[default]
    NotProbed,
    /// Detection ran and found no face, or the image was unprobeable.
    NoFace,
    /// Detection ran and found this many faces.
    Faces(i32),
}

impl FaceProbe {
    /// Build from the database representation.
    #[must_use]
    pub fn from_columns(has_face: Option<bool>, face_count: Option<i32>) -> Self {
        match has_face {
            None => Self::NotProbed,
            Some(false) => Self::NoFace,
            Some(true) => Self::Faces(face_count.unwrap_or(0)),
        }
    }

    /// Database representation: (has_face, face_count).
    #[must_use]
    pub fn to_columns(&self) -> (Option<bool>, Option<i32>) {
        match self {
            Self::NotProbed => (None, None),
            Self::NoFace => (Some(false), Some(0)),
            Self::Faces(n) => (Some(true), Some(*n)),
        }
    }

    #[must_use]
    pub fn is_probed(&self) -> bool {
        !matches!(self, Self::NotProbed)
    }
}

/// Confidence bucket assigned to a match based on cosine similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Similarity thresholds dividing the cosine axis into confidence zones.
///
/// Thresholds live in the mutable ML state store, not in code; the matching
/// engine reads them fresh on each tick so approved changes take effect
/// without a restart. These are the config-default values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            low: 0.50,
            medium: 0.65,
            high: 0.85,
        }
    }
}

impl MatchThresholds {
    /// Assign a confidence tier to a similarity score.
    ///
    /// Returns `None` below the low threshold — no match row is created.
    #[must_use]
    pub fn tier_for(&self, similarity: f64) -> Option<ConfidenceTier> {
        if similarity >= self.high {
            Some(ConfidenceTier::High)
        } else if similarity >= self.medium {
            Some(ConfidenceTier::Medium)
        } else if similarity >= self.low {
            Some(ConfidenceTier::Low)
        } else {
            None
        }
    }
}

/// A contributor's allowlisted account: platform + handle, or a bare domain
/// for personal websites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAccount {
    pub id: Uuid,
    pub contributor_id: Uuid,
    pub platform: Option<String>,
    pub handle: Option<String>,
    pub domain: Option<String>,
}

/// Metadata recorded alongside a centroid embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CentroidMetadata {
    pub embeddings_used: usize,
    pub embeddings_total: usize,
    pub outliers_rejected: usize,
    pub avg_detection_score: f64,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Tier ==========

    #[test]
    fn test_tier_from_name() {
        assert_eq!(Tier::from_name("premium"), Tier::Premium);
        assert_eq!(Tier::from_name("protected"), Tier::Protected);
        assert_eq!(Tier::from_name("free"), Tier::Free);
    }

    #[test]
    fn test_tier_unknown_defaults_to_free() {
        assert_eq!(Tier::from_name("enterprise"), Tier::Free);
        assert_eq!(Tier::from_name(""), Tier::Free);
    }

    #[test]
    fn test_tier_scan_priority() {
        assert_eq!(Tier::Premium.scan_priority(), 2);
        assert_eq!(Tier::Protected.scan_priority(), 1);
        assert_eq!(Tier::Free.scan_priority(), 0);
    }

    #[test]
    fn test_tier_is_paid() {
        assert!(Tier::Premium.is_paid());
        assert!(Tier::Protected.is_paid());
        assert!(!Tier::Free.is_paid());
    }

    // ========== FaceProbe ==========

    #[test]
    fn test_face_probe_not_probed_round_trip() {
        let probe = FaceProbe::from_columns(None, None);
        assert_eq!(probe, FaceProbe::NotProbed);
        assert_eq!(probe.to_columns(), (None, None));
        assert!(!probe.is_probed());
    }

    #[test]
    fn test_face_probe_no_face_round_trip() {
        let probe = FaceProbe::from_columns(Some(false), None);
        assert_eq!(probe, FaceProbe::NoFace);
        assert_eq!(probe.to_columns(), (Some(false), Some(0)));
    }

    #[test]
    fn test_face_probe_faces_round_trip() {
        let probe = FaceProbe::from_columns(Some(true), Some(3));
        assert_eq!(probe, FaceProbe::Faces(3));
        assert_eq!(probe.to_columns(), (Some(true), Some(3)));
        assert!(probe.is_probed());
    }

    #[test]
    fn test_face_probe_true_without_count() {
        // Defensive path: has_face=true with a NULL count reads as 0 faces.
        let probe = FaceProbe::from_columns(Some(true), None);
        assert_eq!(probe, FaceProbe::Faces(0));
    }

    // ========== MatchThresholds ==========

    #[test]
    fn test_tier_for_high() {
        let t = MatchThresholds::default();
        assert_eq!(t.tier_for(0.92), Some(ConfidenceTier::High));
        assert_eq!(t.tier_for(0.85), Some(ConfidenceTier::High));
    }

    #[test]
    fn test_tier_for_medium() {
        let t = MatchThresholds::default();
        assert_eq!(t.tier_for(0.70), Some(ConfidenceTier::Medium));
        assert_eq!(t.tier_for(0.65), Some(ConfidenceTier::Medium));
        assert_eq!(t.tier_for(0.84), Some(ConfidenceTier::Medium));
    }

    #[test]
    fn test_tier_for_low() {
        let t = MatchThresholds::default();
        assert_eq!(t.tier_for(0.58), Some(ConfidenceTier::Low));
        assert_eq!(t.tier_for(0.50), Some(ConfidenceTier::Low));
    }

    #[test]
    fn test_tier_for_below_low_is_none() {
        let t = MatchThresholds::default();
        assert_eq!(t.tier_for(0.49), None);
        assert_eq!(t.tier_for(0.0), None);
    }

    #[test]
    fn test_tier_for_custom_thresholds() {
        // Thresholds come from the ML state store; a changed set must take
        // effect with no code involvement.
        let t = MatchThresholds {
            low: 0.40,
            medium: 0.60,
            high: 0.80,
        };
        assert_eq!(t.tier_for(0.45), Some(ConfidenceTier::Low));
        assert_eq!(t.tier_for(0.79), Some(ConfidenceTier::Medium));
        assert_eq!(t.tier_for(0.80), Some(ConfidenceTier::High));
    }

    #[test]
    fn test_confidence_tier_ordering() {
        assert!(ConfidenceTier::High > ConfidenceTier::Medium);
        assert!(ConfidenceTier::Medium > ConfidenceTier::Low);
    }

    // ========== Status strings ==========

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Interrupted.as_str(), "interrupted");
        assert_eq!(EmbeddingStatus::Skipped.as_str(), "skipped");
        assert_eq!(EmbeddingKind::Centroid.as_str(), "centroid");
        assert_eq!(ConfidenceTier::Medium.as_str(), "medium");
    }

    #[test]
    fn test_centroid_metadata_serde_round_trip() {
        let meta = CentroidMetadata {
            embeddings_used: 3,
            embeddings_total: 4,
            outliers_rejected: 1,
            avg_detection_score: 0.98,
            computed_at: Utc::now(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: CentroidMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
