//! Ingest worker: pending reference images and registry selfies become
//! embeddings; primaries, centroids, scan schedules, and the one-shot
//! historical backfill follow.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use faceguard::detector::FaceDetector;
use faceguard::download::{load_and_resize, RESIZE_TARGET};
use faceguard::embedding::{compute_centroid, CENTROID_MIN_EMBEDDINGS};
use faceguard::error::Result;
use faceguard::tiers::TierPolicy;
use faceguard::types::{CentroidMetadata, EmbeddingStatus};
use faceguard_db::{PendingReferenceImage, PendingRegistrySelfie};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::ScannerContext;

/// Reference images / selfies pulled per tick.
const INGEST_BATCH: i64 = 50;

/// How many backfill hits one new contributor can create.
const BACKFILL_LIMIT: i64 = 100;

/// What a single-face detection pass found.
enum SingleFaceOutcome {
    NoFace,
    MultipleFaces,
    One { embedding: Vec<f32>, score: f64 },
}

/// Process one ingest tick. Returns the number of rows processed.
pub async fn run_ingest(ctx: &Arc<ScannerContext>) -> usize {
    let mut processed = 0;

    match ctx.db.pending_reference_images(INGEST_BATCH).await {
        Ok(images) => {
            for image in images {
                if ctx.is_shutdown() {
                    break;
                }
                let image_id = image.id;
                let contributor_id = image.contributor_id;
                if let Err(e) = process_reference_image(ctx, image).await {
                    error!(
                        image_id = %image_id,
                        contributor_id = %contributor_id,
                        error = %e,
                        "ingest image error"
                    );
                    let reason = format!("unexpected_error: {e}");
                    let truncated: String = reason.chars().take(200).collect();
                    let _ = ctx
                        .db
                        .set_reference_image_status(
                            image_id,
                            EmbeddingStatus::Failed,
                            Some(&truncated),
                        )
                        .await;
                }
                processed += 1;
            }
        }
        Err(e) => error!(error = %e, "pending image fetch failed"),
    }

    match ctx.db.pending_registry_selfies(INGEST_BATCH).await {
        Ok(selfies) => {
            for selfie in selfies {
                if ctx.is_shutdown() {
                    break;
                }
                let cid = selfie.cid.clone();
                if let Err(e) = process_registry_selfie(ctx, selfie).await {
                    error!(cid, error = %e, "registry selfie error");
                    let reason = format!("unexpected_error: {e}");
                    let truncated: String = reason.chars().take(200).collect();
                    let _ = ctx
                        .db
                        .set_registry_embedding_status(
                            &cid,
                            EmbeddingStatus::Failed,
                            Some(&truncated),
                        )
                        .await;
                }
                processed += 1;
            }
        }
        Err(e) => error!(error = %e, "pending selfie fetch failed"),
    }

    if processed > 0 {
        info!(processed, "ingest batch complete");
    }
    processed
}

async fn process_reference_image(
    ctx: &ScannerContext,
    image: PendingReferenceImage,
) -> Result<()> {
    let (Some(bucket), Some(file_path)) = (image.bucket.as_deref(), image.file_path.as_deref())
    else {
        ctx.db
            .set_reference_image_status(
                image.id,
                EmbeddingStatus::Failed,
                Some("missing_file_path"),
            )
            .await?;
        return Ok(());
    };

    // Full-body captures are kept for the capture flow but carry no usable
    // face signal.
    if image.capture_step.as_deref() == Some("full_body") {
        ctx.db
            .set_reference_image_status(
                image.id,
                EmbeddingStatus::Skipped,
                Some("full_body_skipped"),
            )
            .await?;
        return Ok(());
    }

    let Some(storage) = ctx.storage.as_ref() else {
        ctx.db
            .set_reference_image_status(
                image.id,
                EmbeddingStatus::Failed,
                Some("storage_unconfigured"),
            )
            .await?;
        return Ok(());
    };

    let local = match storage.download(bucket, file_path, &ctx.temp).await {
        Ok(path) => path,
        Err(e) => {
            warn!(bucket, file_path, error = %e, "reference image download failed");
            ctx.db
                .set_reference_image_status(
                    image.id,
                    EmbeddingStatus::Failed,
                    Some("download_failed"),
                )
                .await?;
            return Ok(());
        }
    };

    let outcome = detect_single_face(ctx, &local).await;
    let _ = tokio::fs::remove_file(&local).await;

    match outcome? {
        SingleFaceOutcome::NoFace => {
            ctx.db
                .set_reference_image_status(
                    image.id,
                    EmbeddingStatus::Failed,
                    Some("no_face_detected"),
                )
                .await?;
        }
        SingleFaceOutcome::MultipleFaces => {
            // Onboarding photos must be unambiguous.
            ctx.db
                .set_reference_image_status(
                    image.id,
                    EmbeddingStatus::Failed,
                    Some("multiple_faces"),
                )
                .await?;
        }
        SingleFaceOutcome::One { embedding, score } => {
            ctx.db
                .insert_contributor_embedding(
                    image.contributor_id,
                    Some(image.id),
                    &embedding,
                    score,
                )
                .await?;
            ctx.db.update_primary_embedding(image.contributor_id).await?;
            recompute_centroid(ctx, image.contributor_id).await?;
            ctx.db
                .set_reference_image_status(image.id, EmbeddingStatus::Processed, None)
                .await?;
            after_embedding_insert(ctx, image.contributor_id).await?;

            info!(
                image_id = %image.id,
                contributor_id = %image.contributor_id,
                detection_score = score,
                "reference image embedded"
            );
        }
    }
    Ok(())
}

async fn process_registry_selfie(
    ctx: &ScannerContext,
    selfie: PendingRegistrySelfie,
) -> Result<()> {
    let (Some(bucket), Some(path)) = (selfie.selfie_bucket.as_deref(), selfie.selfie_path.as_deref())
    else {
        ctx.db
            .set_registry_embedding_status(
                &selfie.cid,
                EmbeddingStatus::Failed,
                Some("missing_selfie_path"),
            )
            .await?;
        return Ok(());
    };

    let Some(storage) = ctx.storage.as_ref() else {
        ctx.db
            .set_registry_embedding_status(
                &selfie.cid,
                EmbeddingStatus::Failed,
                Some("storage_unconfigured"),
            )
            .await?;
        return Ok(());
    };

    let local = match storage.download(bucket, path, &ctx.temp).await {
        Ok(local) => local,
        Err(e) => {
            warn!(cid = selfie.cid, error = %e, "registry selfie download failed");
            ctx.db
                .set_registry_embedding_status(
                    &selfie.cid,
                    EmbeddingStatus::Failed,
                    Some("download_failed"),
                )
                .await?;
            return Ok(());
        }
    };

    let outcome = detect_single_face(ctx, &local).await;
    let _ = tokio::fs::remove_file(&local).await;

    match outcome? {
        SingleFaceOutcome::NoFace => {
            ctx.db
                .set_registry_embedding_status(
                    &selfie.cid,
                    EmbeddingStatus::Failed,
                    Some("no_face_detected"),
                )
                .await?;
        }
        SingleFaceOutcome::MultipleFaces => {
            ctx.db
                .set_registry_embedding_status(
                    &selfie.cid,
                    EmbeddingStatus::Failed,
                    Some("multiple_faces"),
                )
                .await?;
        }
        SingleFaceOutcome::One { embedding, score } => {
            ctx.db
                .set_registry_embedding(&selfie.cid, &embedding, score)
                .await?;
            info!(cid = selfie.cid, detection_score = score, "registry selfie embedded");
        }
    }
    Ok(())
}

/// Detect exactly one face in an onboarding photo.
async fn detect_single_face(ctx: &ScannerContext, path: &Path) -> Result<SingleFaceOutcome> {
    let Ok(image) = load_and_resize(path, RESIZE_TARGET) else {
        return Ok(SingleFaceOutcome::NoFace);
    };
    let detector: Arc<dyn FaceDetector> = ctx.detector().await?;
    let faces = detector.detect(&image).await?;

    match faces.len() {
        0 => Ok(SingleFaceOutcome::NoFace),
        1 => Ok(SingleFaceOutcome::One {
            embedding: faces[0].embedding.clone(),
            score: f64::from(faces[0].detection_score),
        }),
        _ => Ok(SingleFaceOutcome::MultipleFaces),
    }
}

/// Recompute the contributor's centroid when they have enough singles.
async fn recompute_centroid(ctx: &ScannerContext, contributor_id: Uuid) -> Result<()> {
    let singles = ctx.db.single_embeddings(contributor_id).await?;
    if singles.len() < CENTROID_MIN_EMBEDDINGS {
        return Ok(());
    }

    let vectors: Vec<Vec<f32>> = singles.iter().map(|s| s.vector.clone()).collect();
    let scores: Vec<Option<f64>> = singles.iter().map(|s| s.detection_score).collect();

    let Some(centroid) = compute_centroid(&vectors, &scores)? else {
        return Ok(());
    };

    let metadata = CentroidMetadata {
        embeddings_used: centroid.embeddings_used,
        embeddings_total: centroid.embeddings_total,
        outliers_rejected: centroid.outliers_rejected,
        avg_detection_score: (centroid.avg_detection_score * 1e4).round() / 1e4,
        computed_at: Utc::now(),
    };
    ctx.db
        .replace_centroid(contributor_id, &centroid.vector, &metadata)
        .await?;

    info!(
        contributor_id = %contributor_id,
        embeddings_used = metadata.embeddings_used,
        embeddings_total = metadata.embeddings_total,
        outliers_rejected = metadata.outliers_rejected,
        "centroid computed"
    );
    Ok(())
}

/// After an embedding insert: make sure the scan schedule exists, and on
/// the contributor's very first embedding run the historical backfill.
async fn after_embedding_insert(ctx: &ScannerContext, contributor_id: Uuid) -> Result<()> {
    let Some(contributor) = ctx.db.get_contributor(contributor_id).await? else {
        return Ok(());
    };
    let tier = contributor.tier();
    let policy = TierPolicy::for_tier(tier);

    ctx.db
        .init_scan_schedule(
            contributor_id,
            policy.reverse_image_interval_hours as i32,
            tier.scan_priority(),
        )
        .await?;

    if ctx.db.contributor_embedding_count(contributor_id).await? == 1 {
        run_backfill(ctx, contributor_id).await?;
    }
    Ok(())
}

/// One-shot vector search against stored discovered-face embeddings,
/// catching images discovered before this contributor existed.
async fn run_backfill(ctx: &ScannerContext, contributor_id: Uuid) -> Result<()> {
    let Some(best) = ctx.db.best_embedding(contributor_id).await? else {
        return Ok(());
    };

    let thresholds = ctx
        .db
        .load_thresholds(ctx.config.default_thresholds())
        .await?;
    let hits = ctx
        .db
        .backfill_hits(
            &best.vector,
            thresholds.low,
            ctx.config.civitai_backfill_days,
            BACKFILL_LIMIT,
        )
        .await?;
    if hits.is_empty() {
        return Ok(());
    }

    let mut matches_created = 0;
    for hit in hits {
        let Some(confidence) = thresholds.tier_for(hit.similarity) else {
            continue;
        };
        let inserted = ctx
            .db
            .insert_match(
                hit.discovered_image_id,
                contributor_id,
                hit.similarity,
                confidence,
                Some(best.id),
                hit.face_index,
            )
            .await?;
        if inserted.is_some() {
            matches_created += 1;
        }
    }

    if matches_created > 0 {
        info!(
            contributor_id = %contributor_id,
            matches = matches_created,
            days_searched = ctx.config.civitai_backfill_days,
            "backfill matches created"
        );
    }
    Ok(())
}
