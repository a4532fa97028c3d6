//! # faceguard-db
//!
//! Data store adapter for the FaceGuard scanner: typed queries over the
//! shared PostgreSQL database and its pgvector extension.
//!
//! The database is the only mutable state shared between pipeline
//! workstreams, so every write here carries an explicit conflict policy:
//! `ON CONFLICT ... DO NOTHING` for the dedup-critical tables (discovered
//! images by URL hash, matches by (image, contributor), face embeddings by
//! (image, face index)) and `RETURNING` clauses wherever a caller needs to
//! distinguish new rows from conflicts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use faceguard_db::ScannerDb;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = ScannerDb::connect("host=localhost user=scanner dbname=faceguard", false).await?;
//!     db.ensure_schema().await?;
//!
//!     let pending = db.count_pending_detection().await?;
//!     println!("{pending} images awaiting face detection");
//!     Ok(())
//! }
//! ```

mod cleanup;
mod client;
mod discovered;
mod error;
mod ingest;
mod jobs;
mod matching;
mod metrics;
mod rows;
mod schema;

pub use cleanup::RetentionPolicy;
pub use client::ScannerDb;
pub use error::{Error, Result};
pub use matching::SIMILARITY_LIMIT;
pub use rows::{
    BackfillHit, BestEmbeddingRow, CleanupCounts, ContributorRow, DiscoveredImageInfo, DueCrawl,
    DueScan, MatchIdentity, PendingDetectionImage, PendingReferenceImage, PendingRegistrySelfie,
    ScanJobRow, ScannerMetrics, SimilarityHit, SingleEmbeddingRow, UnmatchedEmbedding,
};
