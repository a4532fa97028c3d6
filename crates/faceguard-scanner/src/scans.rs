//! Per-contributor reverse-image scans, and the shared per-image processor
//! every discovery source funnels through.

use std::sync::Arc;

use faceguard::download::{load_and_resize, RESIZE_TARGET};
use faceguard::error::{Error, Result};
use faceguard::phash::{phash, to_bit_string, DUPLICATE_MAX_DISTANCE};
use faceguard::tiers::TierPolicy;
use faceguard::types::FaceProbe;
use faceguard_db::{DueScan, MatchIdentity};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::ScannerContext;
use crate::matching::{handle_contributor_hit, handle_registry_hit, FaceHit, MatchBatch};

/// One URL entering the shared per-image pipeline.
pub(crate) struct ImageCandidate {
    pub source_url: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub platform: String,
}

struct ScanOutcome {
    images_processed: i32,
    matches_found: i32,
    interval_hours: i32,
}

/// Run every due contributor scan to completion, priority order.
pub async fn run_contributor_scans(ctx: &Arc<ScannerContext>) {
    let due = match ctx.db.due_contributor_scans(ctx.config.scan_batch_size).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "due scan fetch failed");
            return;
        }
    };

    for scan in due {
        if ctx.is_shutdown() {
            break;
        }
        if let Err(e) = execute_contributor_scan(ctx, &scan).await {
            error!(
                contributor_id = %scan.contributor_id,
                error = %e,
                "contributor scan error"
            );
        }
    }
}

async fn execute_contributor_scan(ctx: &Arc<ScannerContext>, scan: &DueScan) -> Result<()> {
    let job_id = ctx
        .db
        .start_scan_job(&scan.scan_type, "tineye", Some(scan.contributor_id))
        .await?;

    match run_scan(ctx, scan).await {
        Ok(outcome) => {
            ctx.db
                .complete_scan_job(job_id, outcome.images_processed, outcome.matches_found)
                .await?;
            ctx.db
                .reschedule_scan(scan.contributor_id, &scan.scan_type, outcome.interval_hours)
                .await?;
            info!(
                contributor_id = %scan.contributor_id,
                images_processed = outcome.images_processed,
                matches_found = outcome.matches_found,
                "contributor scan complete"
            );
            Ok(())
        }
        Err(e) => {
            let _ = ctx.db.fail_scan_job(job_id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn run_scan(ctx: &Arc<ScannerContext>, scan: &DueScan) -> Result<ScanOutcome> {
    let Some(contributor) = ctx.db.get_contributor(scan.contributor_id).await? else {
        return Err(Error::Other("contributor_not_found".to_string()));
    };
    let policy = TierPolicy::for_tier(contributor.tier());
    let interval_hours = policy.reverse_image_interval_hours as i32;
    let empty = ScanOutcome {
        images_processed: 0,
        matches_found: 0,
        interval_hours,
    };

    let photos = ctx
        .db
        .processed_reference_images(
            scan.contributor_id,
            policy.reverse_image_max_photos as i64,
        )
        .await?;
    if photos.is_empty() {
        return Ok(empty);
    }

    let (Some(tineye), Some(storage)) = (ctx.tineye.as_ref(), ctx.storage.as_ref()) else {
        warn!("reverse-image scan skipped: provider or storage unconfigured");
        return Ok(empty);
    };

    let thresholds = ctx
        .db
        .load_thresholds(ctx.config.default_thresholds())
        .await?;
    let mut cache = MatchBatch::new(thresholds);
    let mut images_processed = 0;
    let mut matches_found = 0;

    'photos: for (bucket, path) in &photos {
        if ctx.is_shutdown() {
            break;
        }
        let local = match storage.download(bucket, path, &ctx.temp).await {
            Ok(local) => local,
            Err(e) => {
                warn!(bucket = %bucket, path = %path, error = %e, "reference photo download failed");
                continue;
            }
        };
        let bytes = tokio::fs::read(&local).await?;
        let _ = tokio::fs::remove_file(&local).await;

        let backlinks = match tineye.search(bytes).await {
            Ok(backlinks) => backlinks,
            Err(e) if e.is_circuit_open() => {
                warn!("tineye circuit open; aborting scan");
                break 'photos;
            }
            Err(e) => {
                error!(path = %path, error = %e, "tineye search error");
                continue;
            }
        };

        for link in backlinks {
            if ctx.is_shutdown() {
                break 'photos;
            }
            let candidate = ImageCandidate {
                source_url: link.image_url,
                page_url: Some(link.page_url),
                page_title: None,
                platform: "tineye".to_string(),
            };
            let found = process_discovered_image(
                ctx,
                &mut cache,
                &candidate,
                Some(scan.contributor_id),
            )
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "discovered image processing failed");
                0
            });
            images_processed += 1;
            matches_found += found as i32;
        }
    }

    Ok(ScanOutcome {
        images_processed,
        matches_found,
        interval_hours,
    })
}

/// The shared per-image pipeline: insert (URL dedup), download through the
/// pre-filters, phash dedup, face detection, embedding storage, and vector
/// comparison. Reverse-image scans test the target contributor as a fast
/// path before the full registry.
///
/// Returns the number of matches stored for this image.
pub(crate) async fn process_discovered_image(
    ctx: &ScannerContext,
    cache: &mut MatchBatch,
    candidate: &ImageCandidate,
    target_contributor: Option<Uuid>,
) -> Result<u32> {
    let Some(image_id) = ctx
        .db
        .insert_discovered_image(
            &candidate.source_url,
            candidate.page_url.as_deref(),
            candidate.page_title.as_deref(),
            Some(&candidate.platform),
            None,
        )
        .await?
    else {
        return Ok(0); // URL already known
    };

    let downloaded = match ctx.downloader.fetch(&candidate.source_url).await {
        Ok(downloaded) => downloaded,
        Err(e) => {
            debug!(url = %candidate.source_url, error = %e, "image unprobeable");
            ctx.db.set_face_probe(image_id, FaceProbe::NoFace).await?;
            return Ok(0);
        }
    };

    let decoded = match load_and_resize(&downloaded.path, RESIZE_TARGET) {
        Ok(decoded) => decoded,
        Err(_) => {
            ctx.db.set_face_probe(image_id, FaceProbe::NoFace).await?;
            downloaded.cleanup().await;
            return Ok(0);
        }
    };

    // Visual dedup: an existing image within Hamming distance means this is
    // a re-post; skip detection entirely.
    let bits = to_bit_string(phash(&decoded));
    let duplicate_of = ctx
        .db
        .find_phash_duplicate(&bits, DUPLICATE_MAX_DISTANCE as i32)
        .await
        .unwrap_or(None);
    ctx.db
        .set_image_phash(image_id, &bits, downloaded.width as i32, downloaded.height as i32)
        .await?;
    if duplicate_of.is_some() {
        downloaded.cleanup().await;
        return Ok(0);
    }

    if !downloaded.meets_min_dimensions() {
        ctx.db.set_face_probe(image_id, FaceProbe::NoFace).await?;
        downloaded.cleanup().await;
        return Ok(0);
    }

    let detector = ctx.detector().await?;
    let faces = match detector.detect(&decoded).await {
        Ok(faces) => faces,
        Err(e) => {
            warn!(url = %candidate.source_url, error = %e, "detection failed");
            ctx.db.set_face_probe(image_id, FaceProbe::NoFace).await?;
            downloaded.cleanup().await;
            return Ok(0);
        }
    };
    downloaded.cleanup().await;

    let probe = if faces.is_empty() {
        FaceProbe::NoFace
    } else {
        FaceProbe::Faces(faces.len() as i32)
    };
    ctx.db.set_face_probe(image_id, probe).await?;
    if faces.is_empty() {
        return Ok(0);
    }

    let mut matches_found = 0;
    for (index, detected) in faces.iter().enumerate() {
        let face_index = index as i32;
        ctx.db
            .insert_discovered_face_embedding(
                image_id,
                face_index,
                &detected.embedding,
                Some(f64::from(detected.detection_score)),
            )
            .await?;

        let face = FaceHit {
            discovered_image_id: image_id,
            face_index,
            page_url: candidate.page_url.as_deref(),
        };

        // Fast path: the scan's own contributor first.
        if let Some(target) = target_contributor {
            if let Some(hit) = ctx
                .db
                .find_similar_for_contributor(&detected.embedding, target, cache.thresholds.low)
                .await?
            {
                if handle_contributor_hit(ctx, cache, &face, target, hit.embedding_id, hit.similarity)
                    .await?
                {
                    matches_found += 1;
                }
            }
        }

        // Then the full registry (other contributors + registry identities).
        let hits = ctx
            .db
            .find_all_similar(&detected.embedding, cache.thresholds.low, false)
            .await?;
        for hit in hits {
            let stored = match &hit.identity {
                MatchIdentity::Contributor(contributor_id) => {
                    if Some(*contributor_id) == target_contributor {
                        continue; // fast path already handled it
                    }
                    handle_contributor_hit(
                        ctx,
                        cache,
                        &face,
                        *contributor_id,
                        hit.embedding_id,
                        hit.similarity,
                    )
                    .await?
                }
                MatchIdentity::Registry(cid) => {
                    handle_registry_hit(ctx, cache, &face, cid, hit.similarity).await?
                }
            };
            if stored {
                matches_found += 1;
            }
        }
    }

    Ok(matches_found)
}
