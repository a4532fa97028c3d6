//! The pipeline scheduler: a single long-running loop advancing all
//! subsystems at a steady cadence without starving any one of them.
//!
//! Each tick: ingest, due contributor scans, the taxonomy-mapper hook, the
//! three parallel workstreams (detection, matching, platform crawls), the
//! honeypot and ML-intelligence hooks, and hourly cleanup. Exceptions are
//! caught per step with stable event names; only a termination signal stops
//! the service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use faceguard::error::Result;
use faceguard_db::RetentionPolicy;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::ScannerContext;
use crate::hooks::PipelineHooks;
use crate::{crawl, detect, ingest, matching, scans};

/// Jobs running longer than this at startup are reclassified as failed.
const STALE_JOB_MAX_AGE_MINUTES: i32 = 30;

/// Cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Temp files older than this are swept.
const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(300);

/// Run the scheduler until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error only when startup state (stale-job recovery) cannot be
/// reached; tick-level errors are logged and absorbed.
pub async fn run_scheduler(ctx: Arc<ScannerContext>) -> Result<()> {
    install_signal_handlers(&ctx);

    match ctx.db.recover_stale_jobs(STALE_JOB_MAX_AGE_MINUTES).await {
        Ok(recovered) if recovered > 0 => info!(count = recovered, "stale jobs recovered"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "stale job recovery failed"),
    }

    info!("scheduler started");
    let started = Instant::now();
    let mut last_cleanup: Option<Instant> = None;

    while !ctx.is_shutdown() {
        let tick_start = Instant::now();

        run_tick(&ctx, &mut last_cleanup).await;

        let duration = tick_start.elapsed();
        info!(
            duration_seconds = duration.as_secs_f64(),
            uptime_seconds = started.elapsed().as_secs(),
            "scheduler tick complete"
        );

        let tick = Duration::from_secs(ctx.config.scheduler_tick_seconds.max(1));
        if let Some(remaining) = tick.checked_sub(duration) {
            if !ctx.is_shutdown() {
                tokio::select! {
                    () = tokio::time::sleep(remaining) => {}
                    () = ctx.shutdown.wait() => {}
                }
            }
        }
    }

    info!("scheduler shutting down");
    match ctx.db.interrupt_running_jobs().await {
        Ok(count) if count > 0 => info!(count, "running jobs interrupted"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "job interruption failed"),
    }
    ctx.shutdown_clients().await;
    info!("scheduler stopped");
    Ok(())
}

fn install_signal_handlers(ctx: &Arc<ScannerContext>) {
    let shutdown = Arc::clone(&ctx.shutdown);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        shutdown.trigger();
    });
}

async fn run_tick(ctx: &Arc<ScannerContext>, last_cleanup: &mut Option<Instant>) {
    // a. Ingest pending reference images and registry selfies.
    ingest::run_ingest(ctx).await;
    if ctx.is_shutdown() {
        return;
    }

    // b. Due per-contributor reverse-image scans, priority order.
    scans::run_contributor_scans(ctx).await;
    if ctx.is_shutdown() {
        return;
    }

    // c. Platform taxonomy mapping when due (external collaborator).
    PipelineHooks::run(ctx.hooks.taxonomy_mapper.as_ref()).await;
    if ctx.is_shutdown() {
        return;
    }

    // d. The three parallel workstreams.
    run_parallel_workstreams(ctx).await;
    if ctx.is_shutdown() {
        return;
    }

    // e. Honeypot detection check (external collaborator).
    PipelineHooks::run(ctx.hooks.honeypot.as_ref()).await;

    // f. ML intelligence tick (external collaborator).
    PipelineHooks::run(ctx.hooks.intelligence.as_ref()).await;

    // g. Hourly cleanup, temp-file GC, metrics snapshot.
    let cleanup_due = last_cleanup.map_or(true, |at| at.elapsed() >= CLEANUP_INTERVAL);
    if cleanup_due {
        run_cleanup(ctx).await;
        *last_cleanup = Some(Instant::now());
    }
}

/// Issue the detection, matching, and crawl tasks concurrently and join
/// them, logging each task's outcome individually — one workstream's error
/// never prevents the others from running.
async fn run_parallel_workstreams(ctx: &Arc<ScannerContext>) {
    let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    match ctx.db.count_pending_detection().await {
        Ok(pending) if pending > 0 => {
            info!(phase = "detecting", pending, "workstream dispatch");
            let task_ctx = Arc::clone(ctx);
            handles.push((
                "detection",
                tokio::spawn(async move { detect::run_detection(&task_ctx, pending).await }),
            ));
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "pending detection count failed"),
    }

    match ctx.db.count_unmatched_face_embeddings().await {
        Ok(pending) if pending > 0 => {
            info!(phase = "matching", pending, "workstream dispatch");
            let task_ctx = Arc::clone(ctx);
            handles.push((
                "matching",
                tokio::spawn(async move { matching::run_matching(&task_ctx).await }),
            ));
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "unmatched embedding count failed"),
    }

    match ctx.db.due_platform_crawls().await {
        Ok(due) => {
            for due_crawl in due {
                if ctx.is_shutdown() {
                    break;
                }
                info!(phase = "crawling", platform = %due_crawl.platform, "workstream dispatch");
                let task_ctx = Arc::clone(ctx);
                handles.push((
                    "crawl",
                    tokio::spawn(
                        async move { crawl::run_platform_crawl(&task_ctx, due_crawl).await },
                    ),
                ));
            }
        }
        Err(e) => error!(error = %e, "due crawl fetch failed"),
    }

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(workstream = name, error = %e, "workstream error"),
            Err(e) => error!(workstream = name, error = %e, "workstream panicked"),
        }
    }
}

async fn run_cleanup(ctx: &Arc<ScannerContext>) {
    match ctx.db.run_cleanup(RetentionPolicy::default()).await {
        Ok(counts) => {
            if counts.total() > 0 {
                info!(
                    no_face_images = counts.no_face_images,
                    unmatched_images = counts.unmatched_images,
                    face_embeddings = counts.face_embeddings,
                    finished_jobs = counts.finished_jobs,
                    read_notifications = counts.read_notifications,
                    "cleanup complete"
                );
            }
        }
        Err(e) => error!(error = %e, "cleanup failed"),
    }

    let temp_deleted = ctx.temp.cleanup_old(TEMP_FILE_MAX_AGE);
    if temp_deleted > 0 {
        info!(count = temp_deleted, "temp files swept");
    }

    match ctx.db.scanner_metrics().await {
        Ok(metrics) => info!(
            embeddings_pending = metrics.embeddings_pending,
            images_discovered_24h = metrics.images_discovered_24h,
            images_with_faces_24h = metrics.images_with_faces_24h,
            matches_found_24h = metrics.matches_found_24h,
            matches_known_account_24h = metrics.matches_known_account_24h,
            evidence_captured_24h = metrics.evidence_captured_24h,
            contributors_in_registry = metrics.contributors_in_registry,
            registry_matches_24h = metrics.registry_matches_24h,
            "metrics snapshot"
        ),
        Err(e) => error!(error = %e, "metrics snapshot failed"),
    }
}
