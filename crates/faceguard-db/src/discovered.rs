//! Discovered-image and discovered-face-embedding queries.

use faceguard::discovery::DiscoveredImageResult;
use faceguard::phash::DUPLICATE_WINDOW_DAYS;
use faceguard::types::FaceProbe;
use pgvector::Vector;
use tracing::debug;
use uuid::Uuid;

use crate::client::{validate_phash_bits, ScannerDb};
use crate::error::Result;
use crate::rows::{DiscoveredImageInfo, PendingDetectionImage, UnmatchedEmbedding};

/// Rows per batch-insert statement.
const INSERT_BATCH_SIZE: usize = 500;

impl ScannerDb {
    /// Insert one discovered image. Returns the new row id, or `None` when
    /// the URL already exists (dedup on `md5(source_url)`).
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_discovered_image(
        &self,
        source_url: &str,
        page_url: Option<&str>,
        page_title: Option<&str>,
        platform: Option<&str>,
        scan_job_id: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        let row = self
            .client
            .query_opt(
                "INSERT INTO discovered_images
                     (source_url, page_url, page_title, platform, scan_job_id)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (md5(source_url)) DO NOTHING
                 RETURNING id",
                &[&source_url, &page_url, &page_title, &platform, &scan_job_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Batch-insert URL metadata rows (DEFERRED strategy). Conflicting URLs
    /// are silently dropped; the return value is the new-rows count.
    ///
    /// # Errors
    ///
    /// Returns an error if any batch statement fails.
    pub async fn batch_insert_discovered_images(
        &self,
        images: &[DiscoveredImageResult],
        platform: &str,
    ) -> Result<u64> {
        let mut inserted: u64 = 0;

        for chunk in images.chunks(INSERT_BATCH_SIZE) {
            let mut sql = String::from(
                "INSERT INTO discovered_images
                     (source_url, page_url, page_title, platform, image_stored_url)
                 VALUES ",
            );
            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
            for (i, image) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let base = i * 5;
                sql.push_str(&format!(
                    "(${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5
                ));
                params.push(&image.source_url);
                params.push(&image.page_url);
                params.push(&image.page_title);
                params.push(&image.platform);
                params.push(&image.stored_thumbnail_key);
            }
            sql.push_str(" ON CONFLICT (md5(source_url)) DO NOTHING");

            inserted += self.client.execute(sql.as_str(), &params).await?;
        }

        debug!(platform, total = images.len(), inserted, "batch insert complete");
        Ok(inserted)
    }

    /// Insert one inline-detected image followed by its face embeddings
    /// (INLINE strategy). Returns true when the image row was new.
    ///
    /// The per-face inserts are idempotent on (image, face_index) and run
    /// even when the image row already existed, so a crash between the image
    /// write and its faces is repaired by the next crawl of the same URL.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails.
    pub async fn insert_inline_detected_image(
        &self,
        image: &DiscoveredImageResult,
        scan_job_id: Option<Uuid>,
    ) -> Result<bool> {
        let inserted = self
            .client
            .query_opt(
                "INSERT INTO discovered_images
                     (source_url, page_url, page_title, platform, image_stored_url,
                      has_face, face_count, scan_job_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (md5(source_url)) DO NOTHING
                 RETURNING id",
                &[
                    &image.source_url,
                    &image.page_url,
                    &image.page_title,
                    &image.platform,
                    &image.stored_thumbnail_key,
                    &image.has_face,
                    &image.face_count,
                    &scan_job_id,
                ],
            )
            .await?;

        let (image_id, is_new): (Uuid, bool) = match inserted {
            Some(row) => (row.get(0), true),
            None => {
                let existing = self
                    .client
                    .query_opt(
                        "SELECT id FROM discovered_images WHERE md5(source_url) = md5($1)",
                        &[&image.source_url],
                    )
                    .await?;
                match existing {
                    Some(row) => (row.get(0), false),
                    None => return Ok(false),
                }
            }
        };

        for face in &image.faces {
            self.insert_discovered_face_embedding(
                image_id,
                face.face_index,
                &face.embedding,
                Some(f64::from(face.detection_score)),
            )
            .await?;
        }
        Ok(is_new)
    }

    /// Update a discovered image's face-probe state.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_face_probe(&self, image_id: Uuid, probe: FaceProbe) -> Result<()> {
        let (has_face, face_count) = probe.to_columns();
        self.client
            .execute(
                "UPDATE discovered_images SET has_face = $2, face_count = $3 WHERE id = $1",
                &[&image_id, &has_face, &face_count],
            )
            .await?;
        Ok(())
    }

    /// Record phash and decoded dimensions on a discovered image.
    ///
    /// # Errors
    ///
    /// Returns an error if the bit string is malformed or the update fails.
    pub async fn set_image_phash(
        &self,
        image_id: Uuid,
        phash_bits: &str,
        width: i32,
        height: i32,
    ) -> Result<()> {
        validate_phash_bits(phash_bits)?;
        // The driver cannot bind bit(64); the validated literal is inlined.
        let sql = format!(
            "UPDATE discovered_images
             SET phash = B'{phash_bits}', width = $2, height = $3
             WHERE id = $1"
        );
        self.client
            .execute(sql.as_str(), &[&image_id, &width, &height])
            .await?;
        Ok(())
    }

    /// Find a visually duplicate image by perceptual hash within the dedup
    /// window.
    ///
    /// # Errors
    ///
    /// Returns an error if the bit string is malformed or the query fails.
    pub async fn find_phash_duplicate(
        &self,
        phash_bits: &str,
        max_distance: i32,
    ) -> Result<Option<Uuid>> {
        validate_phash_bits(phash_bits)?;
        let sql = format!(
            "SELECT id FROM discovered_images
             WHERE phash IS NOT NULL
               AND bit_count(phash # B'{phash_bits}') <= $1
               AND discovered_at > now() - make_interval(days => $2)
             LIMIT 1"
        );
        let row = self
            .client
            .query_opt(sql.as_str(), &[&max_distance, &(DUPLICATE_WINDOW_DAYS as i32)])
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Thumbnail/source info needed for post-match actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn discovered_image_info(&self, image_id: Uuid) -> Result<Option<DiscoveredImageInfo>> {
        let row = self
            .client
            .query_opt(
                "SELECT source_url, platform, image_stored_url
                 FROM discovered_images
                 WHERE id = $1",
                &[&image_id],
            )
            .await?;
        Ok(row.map(|row| DiscoveredImageInfo {
            source_url: row.get(0),
            platform: row.get(1),
            stored_thumbnail_key: row.get(2),
        }))
    }

    /// Images still awaiting face detection, newest discoveries first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_detection_batch(&self, limit: i64) -> Result<Vec<PendingDetectionImage>> {
        let rows = self
            .client
            .query(
                "SELECT id, source_url
                 FROM discovered_images
                 WHERE has_face IS NULL
                 ORDER BY discovered_at DESC
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PendingDetectionImage {
                id: row.get(0),
                source_url: row.get(1),
            })
            .collect())
    }

    /// Count of images still awaiting face detection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_pending_detection(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM discovered_images WHERE has_face IS NULL",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Insert one discovered-face embedding; idempotent on
    /// (image, face_index). Returns the row id when newly inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_discovered_face_embedding(
        &self,
        discovered_image_id: Uuid,
        face_index: i32,
        embedding: &[f32],
        detection_score: Option<f64>,
    ) -> Result<Option<Uuid>> {
        let row = self
            .client
            .query_opt(
                "INSERT INTO discovered_face_embeddings
                     (discovered_image_id, face_index, embedding, detection_score)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (discovered_image_id, face_index) DO NOTHING
                 RETURNING id",
                &[
                    &discovered_image_id,
                    &face_index,
                    &Vector::from(embedding.to_vec()),
                    &detection_score,
                ],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Face embeddings not yet compared against the registry, oldest first,
    /// joined to their page URL for allowlist checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn unmatched_face_embeddings(&self, limit: i64) -> Result<Vec<UnmatchedEmbedding>> {
        let rows = self
            .client
            .query(
                "SELECT dfe.id, dfe.embedding, dfe.discovered_image_id, dfe.face_index,
                        di.page_url
                 FROM discovered_face_embeddings dfe
                 JOIN discovered_images di ON di.id = dfe.discovered_image_id
                 WHERE dfe.matched_at IS NULL
                 ORDER BY dfe.created_at
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let vector: Vector = row.get(1);
                UnmatchedEmbedding {
                    id: row.get(0),
                    embedding: vector.to_vec(),
                    discovered_image_id: row.get(2),
                    face_index: row.get(3),
                    page_url: row.get(4),
                }
            })
            .collect())
    }

    /// Count of face embeddings not yet compared against the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_unmatched_face_embeddings(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM discovered_face_embeddings WHERE matched_at IS NULL",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Stamp `matched_at` on a set of processed face embeddings. Once set,
    /// an embedding is never selected for matching again.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_face_embeddings_matched(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let count = self
            .client
            .execute(
                "UPDATE discovered_face_embeddings
                 SET matched_at = now()
                 WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(count)
    }
}
