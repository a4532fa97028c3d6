//! Matching workstream: unmatched face embeddings against the contributor
//! and registry embeddings, with tier-scoped post-match actions.
//!
//! At-least-once semantics: every embedding the batch touched gets its
//! `matched_at` stamped, even when individual hits errored — the dedup
//! indexes on matches keep retries idempotent, and the stamp bounds each
//! tick's work to newly discovered embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use faceguard::error::Result;
use faceguard::tiers::TierPolicy;
use faceguard::types::{KnownAccount, MatchThresholds};
use faceguard::urlparse::check_allowlist;
use faceguard_db::{ContributorRow, DiscoveredImageInfo, MatchIdentity};
use faceguard_supabase::{StorageClient, DISCOVERED_IMAGES_BUCKET};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::ScannerContext;

/// One face embedding being matched: the coordinates post-match actions
/// need.
pub(crate) struct FaceHit<'a> {
    pub discovered_image_id: Uuid,
    pub face_index: i32,
    pub page_url: Option<&'a str>,
}

/// Per-batch caches: thresholds read once per tick, contributors and
/// allowlists preloaded on first touch to avoid per-match roundtrips.
pub(crate) struct MatchBatch {
    pub thresholds: MatchThresholds,
    contributors: HashMap<Uuid, Option<ContributorRow>>,
    allowlists: HashMap<Uuid, Vec<KnownAccount>>,
}

impl MatchBatch {
    pub(crate) fn new(thresholds: MatchThresholds) -> Self {
        Self {
            thresholds,
            contributors: HashMap::new(),
            allowlists: HashMap::new(),
        }
    }

    async fn contributor(
        &mut self,
        ctx: &ScannerContext,
        id: Uuid,
    ) -> Result<Option<ContributorRow>> {
        if let Some(cached) = self.contributors.get(&id) {
            return Ok(cached.clone());
        }
        let row = ctx.db.get_contributor(id).await?;
        self.contributors.insert(id, row.clone());
        Ok(row)
    }

    async fn allowlist(&mut self, ctx: &ScannerContext, id: Uuid) -> Result<Vec<KnownAccount>> {
        if let Some(cached) = self.allowlists.get(&id) {
            return Ok(cached.clone());
        }
        let accounts = ctx.db.known_accounts(id).await?;
        self.allowlists.insert(id, accounts.clone());
        Ok(accounts)
    }
}

/// Run one matching tick over a batch of unmatched embeddings.
///
/// # Errors
///
/// Returns an error only when the batch itself cannot be fetched or
/// stamped; per-hit failures are logged and skipped.
pub async fn run_matching(ctx: &Arc<ScannerContext>) -> Result<()> {
    // Thresholds come from the mutable ML state store so an approved change
    // takes effect on the next tick.
    let thresholds = ctx
        .db
        .load_thresholds(ctx.config.default_thresholds())
        .await?;

    let batch = ctx
        .db
        .unmatched_face_embeddings(ctx.config.matching_batch_size)
        .await?;
    if batch.is_empty() {
        return Ok(());
    }
    info!(batch_size = batch.len(), "matching batch start");

    let mut cache = MatchBatch::new(thresholds);
    let mut processed: Vec<Uuid> = Vec::with_capacity(batch.len());
    let mut matches_found: u32 = 0;

    for entry in &batch {
        if ctx.is_shutdown() {
            break;
        }
        match ctx
            .db
            .find_all_similar(&entry.embedding, thresholds.low, false)
            .await
        {
            Ok(hits) => {
                for hit in hits {
                    let face = FaceHit {
                        discovered_image_id: entry.discovered_image_id,
                        face_index: entry.face_index,
                        page_url: entry.page_url.as_deref(),
                    };
                    let stored = match &hit.identity {
                        MatchIdentity::Contributor(contributor_id) => handle_contributor_hit(
                            ctx,
                            &mut cache,
                            &face,
                            *contributor_id,
                            hit.embedding_id,
                            hit.similarity,
                        )
                        .await
                        .unwrap_or_else(|e| {
                            error!(error = %e, "contributor match handling failed");
                            false
                        }),
                        MatchIdentity::Registry(cid) => {
                            handle_registry_hit(ctx, &cache, &face, cid, hit.similarity)
                                .await
                                .unwrap_or_else(|e| {
                                    error!(error = %e, "registry match handling failed");
                                    false
                                })
                        }
                    };
                    if stored {
                        matches_found += 1;
                    }
                }
                processed.push(entry.id);
            }
            Err(e) => {
                // Leave the rest of the batch unstamped; the next tick
                // retries them.
                error!(error = %e, "similarity query failed");
                break;
            }
        }
    }

    ctx.db.mark_face_embeddings_matched(&processed).await?;
    info!(
        embeddings_processed = processed.len(),
        matches_found, "matching batch complete"
    );
    Ok(())
}

/// Handle one contributor hit: tier lookup, confidence, match insert,
/// allowlist suppression, AI classification, evidence, notification.
/// Returns true when a match row was stored.
pub(crate) async fn handle_contributor_hit(
    ctx: &ScannerContext,
    cache: &mut MatchBatch,
    face: &FaceHit<'_>,
    contributor_id: Uuid,
    best_embedding_id: Option<Uuid>,
    similarity: f64,
) -> Result<bool> {
    let Some(confidence) = cache.thresholds.tier_for(similarity) else {
        return Ok(false);
    };
    let Some(contributor) = cache.contributor(ctx, contributor_id).await? else {
        return Ok(false);
    };
    let policy = TierPolicy::for_tier(contributor.tier());
    if !policy.store_match {
        return Ok(false);
    }

    let accounts = cache.allowlist(ctx, contributor_id).await?;
    let known_account = check_allowlist(face.page_url, &accounts).cloned();

    let Some(match_id) = ctx
        .db
        .insert_match(
            face.discovered_image_id,
            contributor_id,
            similarity,
            confidence,
            best_embedding_id,
            face.face_index,
        )
        .await?
    else {
        return Ok(false); // already matched (dedup)
    };

    if let Some(account) = known_account {
        // Allowlisted: record the suppression and stop.
        ctx.db.set_match_known_account(match_id, account.id).await?;
        return Ok(true);
    }

    if policy.should_run_ai_detection(confidence, false) {
        if let Some(hive) = &ctx.hive {
            let info = ctx.db.discovered_image_info(face.discovered_image_id).await?;
            let image_url = info
                .as_ref()
                .and_then(|i| classification_image_url(ctx.storage.as_deref(), i));
            if let Some(url) = image_url {
                if let Some(verdict) = hive.classify(&url).await {
                    ctx.db
                        .set_match_ai_classification(
                            match_id,
                            verdict.is_ai_generated,
                            verdict.score,
                            verdict.generator.as_deref(),
                        )
                        .await?;
                }
            }
        }
    }

    if policy.should_capture_evidence(confidence, false) {
        if let (Some(page_url), Some(storage)) = (face.page_url, ctx.storage.as_ref()) {
            if let Some(shooter) = ctx.screenshotter().await {
                match shooter.capture(page_url).await {
                    Ok(Some(shot)) => {
                        match storage
                            .upload_evidence(
                                &shot,
                                &ctx.config.evidence_bucket,
                                contributor_id,
                                match_id,
                            )
                            .await
                        {
                            Ok(upload) => {
                                ctx.db
                                    .insert_evidence(
                                        match_id,
                                        "screenshot",
                                        &upload.storage_url,
                                        &upload.sha256_hash,
                                        Some(upload.file_size_bytes),
                                    )
                                    .await?;
                            }
                            Err(e) => warn!(error = %e, "evidence upload failed"),
                        }
                        let _ = tokio::fs::remove_file(&shot).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "evidence capture failed"),
                }
            }
        }
    }

    if policy.should_notify(confidence, false) {
        let (title, body, data) = match_notification(
            match_id,
            similarity,
            confidence.as_str(),
            face.page_url,
            policy.show_full_details,
        );
        ctx.db
            .insert_notification(contributor_id, "match_found", &title, &body, &data)
            .await?;
    }

    Ok(true)
}

/// Registry identities get the simpler path: store the match, nothing else.
pub(crate) async fn handle_registry_hit(
    ctx: &ScannerContext,
    cache: &MatchBatch,
    face: &FaceHit<'_>,
    cid: &str,
    similarity: f64,
) -> Result<bool> {
    let Some(confidence) = cache.thresholds.tier_for(similarity) else {
        return Ok(false);
    };

    let info = ctx.db.discovered_image_info(face.discovered_image_id).await?;
    let inserted = ctx
        .db
        .insert_registry_match(
            cid,
            face.discovered_image_id,
            similarity,
            confidence,
            face.face_index,
            info.as_ref().map(|i| i.source_url.as_str()),
            face.page_url,
            info.as_ref().and_then(|i| i.platform.as_deref()),
        )
        .await?;

    if inserted.is_some() {
        info!(
            cid,
            similarity,
            confidence = confidence.as_str(),
            "registry match stored"
        );
    }
    Ok(inserted.is_some())
}

/// The image URL handed to the AI classifier: the provider-stored thumbnail
/// when present (built into an authenticated storage URL), otherwise the
/// original source URL.
pub(crate) fn classification_image_url(
    storage: Option<&StorageClient>,
    info: &DiscoveredImageInfo,
) -> Option<String> {
    if let Some(key) = &info.stored_thumbnail_key {
        if key.starts_with("http") {
            return Some(key.clone());
        }
        if let Some(storage) = storage {
            return Some(storage.authenticated_url(DISCOVERED_IMAGES_BUCKET, key));
        }
    }
    info.source_url
        .starts_with("http")
        .then(|| info.source_url.clone())
}

/// Notification title, body, and JSON payload for a stored match.
pub(crate) fn match_notification(
    match_id: Uuid,
    similarity: f64,
    confidence: &str,
    page_url: Option<&str>,
    show_full_details: bool,
) -> (String, String, serde_json::Value) {
    let title = "New match detected".to_string();
    let body = format!(
        "A {confidence}-confidence match was found on {}.",
        page_url.unwrap_or("an unknown page")
    );
    let data = json!({
        "match_id": match_id,
        "similarity": similarity,
        "confidence": confidence,
        "page_url": page_url,
        "show_full_details": show_full_details,
    });
    (title, body, data)
}
