//! Deferred face-detection workstream.
//!
//! The parent spawns one child process per chunk (`detect-chunk`
//! subcommand of this same binary); the child loads the detection provider,
//! processes its chunk, and exits, so the model-side memory of the whole
//! chunk is reclaimed with the process. Resumable by construction: rows stay
//! `NotProbed` until a chunk commits their probe state, and embedding
//! inserts are idempotent on (image, face_index).

use std::sync::Arc;
use std::time::Duration;

use faceguard::config::Config;
use faceguard::download::{load_and_resize, ImageDownloader, TempStore, RESIZE_TARGET};
use faceguard::error::{Error, Result};
use faceguard::types::FaceProbe;
use faceguard_db::ScannerDb;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::app::ScannerContext;
use crate::detector::build_detector;

/// Images downloaded concurrently within a chunk (further bounded by the
/// global download semaphore).
const MINI_BATCH: usize = 50;

/// Totals from one chunk, serialized over the child's stdout as "N,M".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub processed: u64,
    pub faces_found: u64,
}

impl ChunkStats {
    /// Parse the child's final "processed,faces" stdout line.
    #[must_use]
    pub fn parse_output(stdout: &str) -> Option<Self> {
        for line in stdout.lines().rev() {
            let mut parts = line.trim().split(',');
            if let (Some(processed), Some(faces)) = (parts.next(), parts.next()) {
                if let (Ok(processed), Ok(faces_found)) =
                    (processed.trim().parse(), faces.trim().parse())
                {
                    return Some(Self {
                        processed,
                        faces_found,
                    });
                }
            }
        }
        None
    }

    #[must_use]
    pub fn to_output(&self) -> String {
        format!("{},{}", self.processed, self.faces_found)
    }
}

/// Parent side: spawn up to `face_detection_max_chunks` children, each
/// processing one chunk, with a per-chunk wall-clock timeout.
pub async fn run_detection(ctx: &Arc<ScannerContext>, pending: i64) -> Result<()> {
    let chunk_size = ctx.config.face_detection_chunk_size;
    let max_chunks = ctx.config.face_detection_max_chunks;
    let timeout = Duration::from_secs(ctx.config.face_detection_timeout);

    info!(
        pending,
        chunk_size, max_chunks, "deferred face detection start"
    );

    let exe = std::env::current_exe()?;
    let mut totals = ChunkStats::default();

    for chunk in 1..=max_chunks {
        if ctx.is_shutdown() {
            break;
        }

        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("detect-chunk")
            .arg("--chunk-size")
            .arg(chunk_size.to_string())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(chunk, error = %e, "detection child spawn failed");
                break;
            }
            Err(_) => {
                // Child killed via kill_on_drop; its rows stay NotProbed and
                // the next tick retries them.
                warn!(chunk, timeout_seconds = timeout.as_secs(), "detection chunk timed out");
                break;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(500).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            error!(chunk, stderr = %tail, "detection chunk failed");
            break;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(stats) = ChunkStats::parse_output(&stdout) else {
            warn!(chunk, "detection chunk produced no stats");
            break;
        };
        totals.processed += stats.processed;
        totals.faces_found += stats.faces_found;
        debug!(chunk, processed = stats.processed, faces = stats.faces_found, "chunk done");

        if stats.processed == 0 {
            break; // nothing left pending
        }
    }

    // Detection is a shared stage, not per-platform.
    let _ = ctx.db.clear_all_crawl_phases().await;

    info!(
        images_processed = totals.processed,
        faces_found = totals.faces_found,
        "deferred face detection complete"
    );
    Ok(())
}

/// Child side: process exactly one chunk and print "processed,faces".
///
/// # Errors
///
/// Returns an error if the database or detection provider cannot be
/// initialized; per-image failures mark the row face-negative instead.
pub async fn run_detection_chunk(config: &Config, chunk_size: i64) -> Result<ChunkStats> {
    let db = ScannerDb::connect(&config.database_url, config.database_ssl).await?;
    let detector = build_detector(config)?;
    detector.init(Some(&config.insightface_model)).await?;

    let temp = TempStore::new(&config.temp_dir)?;
    let proxy = (!config.proxy_url.is_empty()).then(|| config.proxy_url.clone());
    let downloader = ImageDownloader::new(temp, proxy.as_deref())?;

    let batch = db.pending_detection_batch(chunk_size).await?;
    let mut stats = ChunkStats::default();

    for mini in batch.chunks(MINI_BATCH) {
        let downloads = join_all(
            mini.iter()
                .map(|image| downloader.fetch(&image.source_url)),
        )
        .await;

        for (image, download) in mini.iter().zip(downloads) {
            stats.processed += 1;

            let downloaded = match download {
                Ok(downloaded) => downloaded,
                Err(e) => {
                    // Terminally unprobeable; never retried.
                    debug!(url = %image.source_url, error = %e, "download failed");
                    db.set_face_probe(image.id, FaceProbe::NoFace).await?;
                    continue;
                }
            };

            if !downloaded.meets_min_dimensions() {
                db.set_face_probe(image.id, FaceProbe::NoFace).await?;
                downloaded.cleanup().await;
                continue;
            }

            let decoded = match load_and_resize(&downloaded.path, RESIZE_TARGET) {
                Ok(decoded) => decoded,
                Err(_) => {
                    db.set_face_probe(image.id, FaceProbe::NoFace).await?;
                    downloaded.cleanup().await;
                    continue;
                }
            };

            let faces = match detector.detect(&decoded).await {
                Ok(faces) => faces,
                Err(e) => {
                    warn!(url = %image.source_url, error = %e, "detection failed");
                    db.set_face_probe(image.id, FaceProbe::NoFace).await?;
                    downloaded.cleanup().await;
                    continue;
                }
            };
            downloaded.cleanup().await;

            if faces.is_empty() {
                db.set_face_probe(image.id, FaceProbe::NoFace).await?;
                continue;
            }

            db.set_face_probe(image.id, FaceProbe::Faces(faces.len() as i32))
                .await?;
            for (index, face) in faces.iter().enumerate() {
                db.insert_discovered_face_embedding(
                    image.id,
                    index as i32,
                    &face.embedding,
                    Some(f64::from(face.detection_score)),
                )
                .await?;
                stats.faces_found += 1;
            }
        }
    }

    Ok(stats)
}

/// Manual multi-chunk runner for the `process-faces` subcommand: loops
/// chunks in-process, spawning a `detect-chunk` child per chunk exactly
/// like the scheduler does. `max_chunks` of zero means run until drained.
///
/// # Errors
///
/// Returns an error if the current executable path cannot be resolved.
pub async fn run_process_faces(config: &Config, chunk_size: i64, max_chunks: u32) -> Result<ChunkStats> {
    let exe = std::env::current_exe()?;
    let timeout = Duration::from_secs(config.face_detection_timeout);
    let mut totals = ChunkStats::default();
    let mut chunk: u32 = 0;

    loop {
        chunk += 1;
        if max_chunks > 0 && chunk > max_chunks {
            info!(max_chunks, "reached max chunks");
            break;
        }

        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("detect-chunk")
            .arg("--chunk-size")
            .arg(chunk_size.to_string())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::Other("detection chunk timed out".to_string()))??;

        if !output.status.success() {
            return Err(Error::Other(format!(
                "detection chunk exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stats = ChunkStats::parse_output(&stdout).unwrap_or_default();
        totals.processed += stats.processed;
        totals.faces_found += stats.faces_found;
        info!(chunk, processed = stats.processed, faces = stats.faces_found, "chunk complete");

        if stats.processed == 0 {
            break;
        }
    }

    Ok(totals)
}
