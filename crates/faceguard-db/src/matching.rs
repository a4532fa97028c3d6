//! Vector similarity queries, match inserts, and the mutable threshold
//! store.

use faceguard::types::{ConfidenceTier, KnownAccount, MatchThresholds};
use pgvector::Vector;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::client::ScannerDb;
use crate::error::Result;
use crate::rows::{BackfillHit, MatchIdentity, SimilarityHit};

/// Top-K limit for similarity hits per query embedding.
pub const SIMILARITY_LIMIT: i64 = 5;

/// The combined contributor + registry similarity query.
///
/// Contributor branch: opted-out and suspended contributors excluded,
/// optionally restricted to primary embeddings. Registry branch: processed
/// embeddings of claimed/verified identities. Both filter on
/// `similarity > threshold`; the union is ordered by similarity descending.
const SIMILARITY_SQL_ALL: &str = "
(
    SELECT ce.contributor_id::text AS identity_id,
           ce.id AS embedding_id,
           1 - (ce.embedding <=> CAST($1 AS vector(512))) AS similarity,
           'contributor' AS source
    FROM contributor_embeddings ce
    JOIN contributors c ON c.id = ce.contributor_id
    WHERE 1 - (ce.embedding <=> CAST($1 AS vector(512))) > $2
      AND c.opted_out = false
      AND c.suspended = false
)
UNION ALL
(
    SELECT ri.cid AS identity_id,
           NULL::uuid AS embedding_id,
           1 - (ri.face_embedding <=> CAST($1 AS vector(512))) AS similarity,
           'registry' AS source
    FROM registry_identities ri
    WHERE ri.face_embedding IS NOT NULL
      AND ri.embedding_status = 'processed'
      AND ri.status IN ('claimed', 'verified')
      AND 1 - (ri.face_embedding <=> CAST($1 AS vector(512))) > $2
)
ORDER BY similarity DESC
LIMIT $3";

const SIMILARITY_SQL_ALL_PRIMARY: &str = "
(
    SELECT ce.contributor_id::text AS identity_id,
           ce.id AS embedding_id,
           1 - (ce.embedding <=> CAST($1 AS vector(512))) AS similarity,
           'contributor' AS source
    FROM contributor_embeddings ce
    JOIN contributors c ON c.id = ce.contributor_id
    WHERE 1 - (ce.embedding <=> CAST($1 AS vector(512))) > $2
      AND c.opted_out = false
      AND c.suspended = false
      AND ce.is_primary = true
)
UNION ALL
(
    SELECT ri.cid AS identity_id,
           NULL::uuid AS embedding_id,
           1 - (ri.face_embedding <=> CAST($1 AS vector(512))) AS similarity,
           'registry' AS source
    FROM registry_identities ri
    WHERE ri.face_embedding IS NOT NULL
      AND ri.embedding_status = 'processed'
      AND ri.status IN ('claimed', 'verified')
      AND 1 - (ri.face_embedding <=> CAST($1 AS vector(512))) > $2
)
ORDER BY similarity DESC
LIMIT $3";

impl ScannerDb {
    /// Find contributors and registry identities similar to a query
    /// embedding, above `threshold`, best first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_all_similar(
        &self,
        embedding: &[f32],
        threshold: f64,
        primary_only: bool,
    ) -> Result<Vec<SimilarityHit>> {
        let sql = if primary_only {
            SIMILARITY_SQL_ALL_PRIMARY
        } else {
            SIMILARITY_SQL_ALL
        };
        let rows = self
            .client
            .query(
                sql,
                &[
                    &Vector::from(embedding.to_vec()),
                    &threshold,
                    &SIMILARITY_LIMIT,
                ],
            )
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let identity_id: String = row.get(0);
            let source: String = row.get(3);
            let identity = if source == "contributor" {
                MatchIdentity::Contributor(
                    Uuid::parse_str(&identity_id)
                        .map_err(|e| crate::error::Error::InvalidRow(e.to_string()))?,
                )
            } else {
                MatchIdentity::Registry(identity_id)
            };
            hits.push(SimilarityHit {
                identity,
                embedding_id: row.get(1),
                similarity: row.get(2),
            });
        }
        Ok(hits)
    }

    /// Similarity of a query embedding to one specific contributor's best
    /// hit (the reverse-image fast path).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_similar_for_contributor(
        &self,
        embedding: &[f32],
        contributor_id: Uuid,
        threshold: f64,
    ) -> Result<Option<SimilarityHit>> {
        let row = self
            .client
            .query_opt(
                "SELECT ce.id,
                        1 - (ce.embedding <=> CAST($1 AS vector(512))) AS similarity
                 FROM contributor_embeddings ce
                 JOIN contributors c ON c.id = ce.contributor_id
                 WHERE ce.contributor_id = $2
                   AND c.opted_out = false
                   AND c.suspended = false
                   AND 1 - (ce.embedding <=> CAST($1 AS vector(512))) > $3
                 ORDER BY ce.embedding <=> CAST($1 AS vector(512))
                 LIMIT 1",
                &[&Vector::from(embedding.to_vec()), &contributor_id, &threshold],
            )
            .await?;
        Ok(row.map(|row| SimilarityHit {
            identity: MatchIdentity::Contributor(contributor_id),
            embedding_id: Some(row.get(0)),
            similarity: row.get(1),
        }))
    }

    /// One-shot backfill: discovered-face embeddings similar to a new
    /// contributor's embedding within the lookback window.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn backfill_hits(
        &self,
        embedding: &[f32],
        threshold: f64,
        days_back: i64,
        limit: i64,
    ) -> Result<Vec<BackfillHit>> {
        let rows = self
            .client
            .query(
                "SELECT dfe.discovered_image_id, dfe.face_index,
                        1 - (dfe.embedding <=> CAST($1 AS vector(512))) AS similarity
                 FROM discovered_face_embeddings dfe
                 WHERE 1 - (dfe.embedding <=> CAST($1 AS vector(512))) > $2
                   AND dfe.created_at > now() - make_interval(days => $3)
                 ORDER BY dfe.embedding <=> CAST($1 AS vector(512))
                 LIMIT $4",
                &[
                    &Vector::from(embedding.to_vec()),
                    &threshold,
                    &(days_back as i32),
                    &limit,
                ],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| BackfillHit {
                discovered_image_id: row.get(0),
                face_index: row.get(1),
                similarity: row.get(2),
            })
            .collect())
    }

    /// Insert a match; dedup on (image, contributor). Returns the match id
    /// when newly created.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_match(
        &self,
        discovered_image_id: Uuid,
        contributor_id: Uuid,
        similarity_score: f64,
        confidence_tier: ConfidenceTier,
        best_embedding_id: Option<Uuid>,
        face_index: i32,
    ) -> Result<Option<Uuid>> {
        let row = self
            .client
            .query_opt(
                "INSERT INTO matches
                     (discovered_image_id, contributor_id, similarity_score,
                      confidence_tier, best_embedding_id, face_index)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (discovered_image_id, contributor_id) DO NOTHING
                 RETURNING id",
                &[
                    &discovered_image_id,
                    &contributor_id,
                    &similarity_score,
                    &confidence_tier.as_str(),
                    &best_embedding_id,
                    &face_index,
                ],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Flag a match as covered by the contributor's allowlist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_match_known_account(
        &self,
        match_id: Uuid,
        known_account_id: Uuid,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE matches
                 SET is_known_account = true, known_account_id = $2
                 WHERE id = $1",
                &[&match_id, &known_account_id],
            )
            .await?;
        Ok(())
    }

    /// Record AI-generation classification results on a match.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_match_ai_classification(
        &self,
        match_id: Uuid,
        is_ai_generated: bool,
        score: f64,
        generator: Option<&str>,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE matches
                 SET is_ai_generated = $2, ai_detection_score = $3, ai_generator = $4
                 WHERE id = $1",
                &[&match_id, &is_ai_generated, &score, &generator],
            )
            .await?;
        Ok(())
    }

    /// Insert a registry match; dedup on (cid, image, face_index). Returns
    /// the id when newly created.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_registry_match(
        &self,
        cid: &str,
        discovered_image_id: Uuid,
        similarity_score: f64,
        confidence_tier: ConfidenceTier,
        face_index: i32,
        source_url: Option<&str>,
        page_url: Option<&str>,
        platform: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let row = self
            .client
            .query_opt(
                "INSERT INTO registry_matches
                     (cid, discovered_image_id, similarity_score, confidence_tier,
                      face_index, source_url, page_url, platform)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (cid, discovered_image_id, face_index) DO NOTHING
                 RETURNING id",
                &[
                    &cid,
                    &discovered_image_id,
                    &similarity_score,
                    &confidence_tier.as_str(),
                    &face_index,
                    &source_url,
                    &page_url,
                    &platform,
                ],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// All known accounts for a contributor, for per-batch preloading.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn known_accounts(&self, contributor_id: Uuid) -> Result<Vec<KnownAccount>> {
        let rows = self
            .client
            .query(
                "SELECT id, contributor_id, platform, handle, domain
                 FROM contributor_known_accounts
                 WHERE contributor_id = $1",
                &[&contributor_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| KnownAccount {
                id: row.get(0),
                contributor_id: row.get(1),
                platform: row.get(2),
                handle: row.get(3),
                domain: row.get(4),
            })
            .collect())
    }

    /// Insert a notification row for a contributor.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_notification(
        &self,
        contributor_id: Uuid,
        notification_type: &str,
        title: &str,
        body: &str,
        data: &serde_json::Value,
    ) -> Result<Uuid> {
        let row = self
            .client
            .query_one(
                "INSERT INTO scanner_notifications
                     (contributor_id, notification_type, title, body, data)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
                &[&contributor_id, &notification_type, &title, &body, &data],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Insert an evidence row for a match.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_evidence(
        &self,
        match_id: Uuid,
        evidence_type: &str,
        storage_url: &str,
        sha256_hash: &str,
        file_size_bytes: Option<i32>,
    ) -> Result<Uuid> {
        let row = self
            .client
            .query_one(
                "INSERT INTO evidence
                     (match_id, evidence_type, storage_url, sha256_hash, file_size_bytes)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
                &[
                    &match_id,
                    &evidence_type,
                    &storage_url,
                    &sha256_hash,
                    &file_size_bytes,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    // --- Mutable threshold store ---

    /// Load the active similarity thresholds from the ML state store,
    /// falling back to the config defaults. Read fresh at the start of
    /// every matching tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_thresholds(&self, defaults: MatchThresholds) -> Result<MatchThresholds> {
        let row = self
            .client
            .query_opt(
                "SELECT value FROM ml_state WHERE key = 'match_thresholds'",
                &[],
            )
            .await?;
        let Some(row) = row else {
            return Ok(defaults);
        };
        let value: serde_json::Value = row.get(0);
        let thresholds = MatchThresholds {
            low: value.get("low").and_then(serde_json::Value::as_f64).unwrap_or(defaults.low),
            medium: value
                .get("medium")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(defaults.medium),
            high: value
                .get("high")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(defaults.high),
        };
        debug!(
            low = thresholds.low,
            medium = thresholds.medium,
            high = thresholds.high,
            "thresholds loaded"
        );
        Ok(thresholds)
    }

    /// Persist similarity thresholds to the ML state store (the applier's
    /// write path for approved recommendations).
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn store_thresholds(&self, thresholds: MatchThresholds) -> Result<()> {
        let value = json!({
            "low": thresholds.low,
            "medium": thresholds.medium,
            "high": thresholds.high,
        });
        self.client
            .execute(
                "INSERT INTO ml_state (key, value, updated_at)
                 VALUES ('match_thresholds', $1, now())
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
                &[&value],
            )
            .await?;
        Ok(())
    }
}
