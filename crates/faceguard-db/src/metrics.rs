//! Operational metrics snapshot, logged periodically by the scheduler.

use crate::client::ScannerDb;
use crate::error::Result;
use crate::rows::ScannerMetrics;

impl ScannerDb {
    /// Collect the 24-hour operational snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if any query fails.
    pub async fn scanner_metrics(&self) -> Result<ScannerMetrics> {
        let row = self
            .client
            .query_one(
                "SELECT
                   (SELECT count(*) FROM contributor_images
                    WHERE embedding_status = 'pending'),
                   (SELECT count(*) FROM contributor_embeddings
                    WHERE created_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM scan_jobs
                    WHERE status = 'completed'
                      AND completed_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM scan_jobs
                    WHERE status = 'failed'
                      AND completed_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM discovered_images
                    WHERE discovered_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM discovered_images
                    WHERE has_face = true
                      AND discovered_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM matches
                    WHERE created_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM matches
                    WHERE is_known_account = true
                      AND created_at > now() - interval '24 hours'),
                   (SELECT count(*) FROM evidence
                    WHERE captured_at > now() - interval '24 hours'),
                   (SELECT count(DISTINCT contributor_id) FROM contributor_embeddings),
                   (SELECT count(*) FROM registry_identities
                    WHERE face_embedding IS NOT NULL),
                   (SELECT count(*) FROM registry_matches
                    WHERE discovered_at > now() - interval '24 hours')",
                &[],
            )
            .await?;

        Ok(ScannerMetrics {
            embeddings_pending: row.get(0),
            embeddings_processed_24h: row.get(1),
            scans_completed_24h: row.get(2),
            scans_failed_24h: row.get(3),
            images_discovered_24h: row.get(4),
            images_with_faces_24h: row.get(5),
            matches_found_24h: row.get(6),
            matches_known_account_24h: row.get(7),
            evidence_captured_24h: row.get(8),
            contributors_in_registry: row.get(9),
            registry_identities_with_embedding: row.get(10),
            registry_matches_24h: row.get(11),
        })
    }
}
