//! Ingest queries: reference images and registry selfies into embeddings.

use faceguard::types::{CentroidMetadata, EmbeddingStatus};
use pgvector::Vector;
use uuid::Uuid;

use crate::client::ScannerDb;
use crate::error::Result;
use crate::rows::{
    BestEmbeddingRow, ContributorRow, PendingRegistrySelfie, PendingReferenceImage,
    SingleEmbeddingRow,
};

impl ScannerDb {
    /// Reference images with `embedding_status = 'pending'`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_reference_images(&self, limit: i64) -> Result<Vec<PendingReferenceImage>> {
        let rows = self
            .client
            .query(
                "SELECT id, contributor_id, bucket, file_path, capture_step
                 FROM contributor_images
                 WHERE embedding_status = 'pending'
                 ORDER BY created_at
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PendingReferenceImage {
                id: row.get(0),
                contributor_id: row.get(1),
                bucket: row.get(2),
                file_path: row.get(3),
                capture_step: row.get(4),
            })
            .collect())
    }

    /// Transition a reference image's embedding status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_reference_image_status(
        &self,
        image_id: Uuid,
        status: EmbeddingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE contributor_images
                 SET embedding_status = $2, embedding_error = $3
                 WHERE id = $1",
                &[&image_id, &status.as_str(), &error],
            )
            .await?;
        Ok(())
    }

    /// Insert a single embedding for a contributor. Returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_contributor_embedding(
        &self,
        contributor_id: Uuid,
        source_image_id: Option<Uuid>,
        embedding: &[f32],
        detection_score: f64,
    ) -> Result<Uuid> {
        let row = self
            .client
            .query_one(
                "INSERT INTO contributor_embeddings
                     (contributor_id, source_image_id, embedding, detection_score,
                      is_primary, embedding_type)
                 VALUES ($1, $2, $3, $4, false, 'single')
                 RETURNING id",
                &[
                    &contributor_id,
                    &source_image_id,
                    &Vector::from(embedding.to_vec()),
                    &detection_score,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Re-point `is_primary` at the highest detection-score embedding.
    ///
    /// Centroid recomputation runs after this and takes the primary over
    /// when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if either statement fails.
    pub async fn update_primary_embedding(&self, contributor_id: Uuid) -> Result<()> {
        self.client
            .execute(
                "UPDATE contributor_embeddings
                 SET is_primary = false
                 WHERE contributor_id = $1 AND is_primary = true",
                &[&contributor_id],
            )
            .await?;
        self.client
            .execute(
                "UPDATE contributor_embeddings
                 SET is_primary = true
                 WHERE id = (
                     SELECT id FROM contributor_embeddings
                     WHERE contributor_id = $1
                     ORDER BY detection_score DESC NULLS LAST
                     LIMIT 1
                 )",
                &[&contributor_id],
            )
            .await?;
        Ok(())
    }

    /// All single embeddings for a contributor, for centroid recomputation.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn single_embeddings(&self, contributor_id: Uuid) -> Result<Vec<SingleEmbeddingRow>> {
        let rows = self
            .client
            .query(
                "SELECT id, embedding, detection_score
                 FROM contributor_embeddings
                 WHERE contributor_id = $1 AND embedding_type = 'single'
                 ORDER BY created_at",
                &[&contributor_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let vector: Vector = row.get(1);
                SingleEmbeddingRow {
                    id: row.get(0),
                    vector: vector.to_vec(),
                    detection_score: row.get(2),
                }
            })
            .collect())
    }

    /// Replace the contributor's centroid: clear sibling primaries, delete
    /// any previous centroid row, insert the new one as primary.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn replace_centroid(
        &self,
        contributor_id: Uuid,
        centroid: &[f32],
        metadata: &CentroidMetadata,
    ) -> Result<Uuid> {
        self.client
            .execute(
                "UPDATE contributor_embeddings
                 SET is_primary = false
                 WHERE contributor_id = $1 AND is_primary = true",
                &[&contributor_id],
            )
            .await?;
        self.client
            .execute(
                "DELETE FROM contributor_embeddings
                 WHERE contributor_id = $1 AND embedding_type = 'centroid'",
                &[&contributor_id],
            )
            .await?;
        let metadata_json = serde_json::to_value(metadata)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO contributor_embeddings
                     (contributor_id, embedding, detection_score, is_primary,
                      embedding_type, centroid_metadata)
                 VALUES ($1, $2, $3, true, 'centroid', $4)
                 RETURNING id",
                &[
                    &contributor_id,
                    &Vector::from(centroid.to_vec()),
                    &metadata.avg_detection_score,
                    &metadata_json,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Total embeddings stored for a contributor.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn contributor_embedding_count(&self, contributor_id: Uuid) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM contributor_embeddings WHERE contributor_id = $1",
                &[&contributor_id],
            )
            .await?;
        Ok(row.get(0))
    }

    /// The contributor's best reference embedding: centroid preferred, then
    /// highest detection score.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn best_embedding(&self, contributor_id: Uuid) -> Result<Option<BestEmbeddingRow>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, embedding
                 FROM contributor_embeddings
                 WHERE contributor_id = $1
                 ORDER BY (embedding_type = 'centroid') DESC,
                          detection_score DESC NULLS LAST
                 LIMIT 1",
                &[&contributor_id],
            )
            .await?;
        Ok(row.map(|row| {
            let vector: Vector = row.get(1);
            BestEmbeddingRow {
                id: row.get(0),
                vector: vector.to_vec(),
            }
        }))
    }

    /// Fetch a contributor by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_contributor(&self, contributor_id: Uuid) -> Result<Option<ContributorRow>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, subscription_tier, opted_out, suspended
                 FROM contributors
                 WHERE id = $1",
                &[&contributor_id],
            )
            .await?;
        Ok(row.map(|row| ContributorRow {
            id: row.get(0),
            subscription_tier: row.get(1),
            opted_out: row.get(2),
            suspended: row.get(3),
        }))
    }

    /// Idempotently create the contributor's reverse-image scan schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn init_scan_schedule(
        &self,
        contributor_id: Uuid,
        interval_hours: i32,
        priority: i32,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO scan_schedule
                     (contributor_id, scan_type, next_scan_at, scan_interval_hours, priority)
                 VALUES ($1, 'reverse_image', now(), $2, $3)
                 ON CONFLICT (contributor_id, scan_type) DO NOTHING",
                &[&contributor_id, &interval_hours, &priority],
            )
            .await?;
        Ok(())
    }

    /// Processed reference images usable for reverse-image search, as
    /// (bucket, path) pairs, capped by the tier's photo budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn processed_reference_images(
        &self,
        contributor_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(String, String)>> {
        let rows = self
            .client
            .query(
                "SELECT bucket, file_path
                 FROM contributor_images
                 WHERE contributor_id = $1
                   AND embedding_status = 'processed'
                   AND bucket IS NOT NULL
                   AND file_path IS NOT NULL
                 ORDER BY created_at
                 LIMIT $2",
                &[&contributor_id, &limit],
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    // --- Registry selfies ---

    /// Registry identities with a pending selfie ready for embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_registry_selfies(&self, limit: i64) -> Result<Vec<PendingRegistrySelfie>> {
        let rows = self
            .client
            .query(
                "SELECT cid, selfie_bucket, selfie_path
                 FROM registry_identities
                 WHERE embedding_status = 'pending'
                   AND selfie_bucket IS NOT NULL
                   AND selfie_path IS NOT NULL
                   AND status IN ('claimed', 'verified')
                 ORDER BY created_at
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PendingRegistrySelfie {
                cid: row.get(0),
                selfie_bucket: row.get(1),
                selfie_path: row.get(2),
            })
            .collect())
    }

    /// Store a registry identity's embedding and mark it processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_registry_embedding(
        &self,
        cid: &str,
        embedding: &[f32],
        detection_score: f64,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE registry_identities
                 SET face_embedding = $2,
                     detection_score = $3,
                     embedding_status = 'processed',
                     embedding_error = NULL
                 WHERE cid = $1",
                &[&cid, &Vector::from(embedding.to_vec()), &detection_score],
            )
            .await?;
        Ok(())
    }

    /// Transition a registry identity's embedding status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_registry_embedding_status(
        &self,
        cid: &str,
        status: EmbeddingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE registry_identities
                 SET embedding_status = $2, embedding_error = $3
                 WHERE cid = $1",
                &[&cid, &status.as_str(), &error],
            )
            .await?;
        Ok(())
    }
}
