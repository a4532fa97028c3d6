//! Platform-crawl workstream: uniform strategy dispatch, batch inserts,
//! cursor persistence, coverage accounting.

use std::sync::Arc;

use faceguard::discovery::{CursorState, DetectionStrategy, DiscoverySource};
use faceguard::error::Result;
use faceguard_db::DueCrawl;
use tracing::{error, info, warn};

use crate::app::ScannerContext;

struct CrawlStats {
    total_discovered: usize,
    new_inserted: u64,
    tags_total: u32,
    tags_exhausted: u32,
}

/// Run one platform's crawl tick: discover, insert, persist cursors,
/// update coverage. A scan-job row brackets the attempt.
pub async fn run_platform_crawl(ctx: &Arc<ScannerContext>, due: DueCrawl) -> Result<()> {
    let Some(provider) = ctx.providers.get(&due.platform).cloned() else {
        warn!(platform = %due.platform, "unknown platform in crawl schedule");
        return Ok(());
    };

    let _ = ctx.db.set_crawl_phase(&due.platform, Some("crawling")).await;
    let job_id = ctx
        .db
        .start_scan_job("platform_crawl", &due.platform, None)
        .await?;

    let outcome = execute_crawl(ctx, &provider, &due).await;
    let result = match outcome {
        Ok(stats) => {
            ctx.db
                .complete_scan_job(job_id, stats.total_discovered as i32, 0)
                .await?;
            info!(
                platform = %due.platform,
                strategy = provider.detection_strategy().as_str(),
                total_discovered = stats.total_discovered,
                new_inserted = stats.new_inserted,
                tags_total = stats.tags_total,
                tags_exhausted = stats.tags_exhausted,
                "platform crawl complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(platform = %due.platform, error = %e, "platform crawl failed");
            ctx.db.fail_scan_job(job_id, &e.to_string()).await?;
            Err(e)
        }
    };

    let _ = ctx.db.set_crawl_phase(&due.platform, None).await;
    result
}

async fn execute_crawl(
    ctx: &Arc<ScannerContext>,
    provider: &Arc<dyn DiscoverySource>,
    due: &DueCrawl,
) -> Result<CrawlStats> {
    let strategy = provider.detection_strategy();
    let mut cursors = CursorState::from_json(due.cursor_blob.as_ref());
    let context = cursors.to_context(&due.platform);

    // Uniform dispatch: INLINE providers detect during the crawl and hand
    // back annotated rows; DEFERRED providers hand back URL metadata only.
    let result = match strategy {
        DetectionStrategy::Inline => {
            let detector = ctx.detector().await?;
            provider.discover_with_detection(&context, detector).await?
        }
        DetectionStrategy::Deferred => provider.discover(&context).await?,
    };

    let new_inserted = match strategy {
        DetectionStrategy::Inline => {
            let mut new_count: u64 = 0;
            for image in &result.images {
                if ctx.is_shutdown() {
                    break;
                }
                if ctx.db.insert_inline_detected_image(image, None).await? {
                    new_count += 1;
                }
            }
            new_count
        }
        DetectionStrategy::Deferred => {
            ctx.db
                .batch_insert_discovered_images(&result.images, &due.platform)
                .await?
        }
    };

    // Cursors persist only after the whole tick's pages are processed; the
    // timestamps advance even when the provider aborted on a circuit-open,
    // so the platform is not retried in a tight loop.
    cursors.apply(&result);
    ctx.db.complete_platform_crawl(&due.platform, &cursors).await?;
    ctx.db
        .update_crawl_coverage(
            &due.platform,
            new_inserted as i32,
            result.tags_total as i32,
            result.tags_exhausted as i32,
        )
        .await?;

    Ok(CrawlStats {
        total_discovered: result.images.len(),
        new_inserted,
        tags_total: result.tags_total,
        tags_exhausted: result.tags_exhausted,
    })
}
