//! Durable scheduling state: due scans and crawls, job lifecycle, stale
//! recovery.

use faceguard::discovery::CursorState;
use faceguard::types::JobStatus;
use tracing::info;
use uuid::Uuid;

use crate::client::ScannerDb;
use crate::error::Result;
use crate::rows::{DueCrawl, DueScan, ScanJobRow};

impl ScannerDb {
    /// Due contributor scans, priority descending then next-scan time
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn due_contributor_scans(&self, batch_size: i64) -> Result<Vec<DueScan>> {
        let rows = self
            .client
            .query(
                "SELECT contributor_id, scan_type, scan_interval_hours, priority
                 FROM scan_schedule
                 WHERE next_scan_at <= now()
                 ORDER BY priority DESC, next_scan_at
                 LIMIT $1",
                &[&batch_size],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DueScan {
                contributor_id: row.get(0),
                scan_type: row.get(1),
                interval_hours: row.get(2),
                priority: row.get(3),
            })
            .collect())
    }

    /// Reschedule a contributor scan after a completed run.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reschedule_scan(
        &self,
        contributor_id: Uuid,
        scan_type: &str,
        interval_hours: i32,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE scan_schedule
                 SET last_scan_at = now(),
                     next_scan_at = now() + make_interval(hours => $3)
                 WHERE contributor_id = $1 AND scan_type = $2",
                &[&contributor_id, &scan_type, &interval_hours],
            )
            .await?;
        Ok(())
    }

    /// Enabled platforms whose next crawl time has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn due_platform_crawls(&self) -> Result<Vec<DueCrawl>> {
        let rows = self
            .client
            .query(
                "SELECT platform, search_terms
                 FROM platform_crawl_schedule
                 WHERE enabled = true AND next_crawl_at <= now()",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DueCrawl {
                platform: row.get(0),
                cursor_blob: row.get(1),
            })
            .collect())
    }

    /// Idempotently register a platform in the crawl schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn ensure_platform_schedule(
        &self,
        platform: &str,
        interval_hours: i32,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO platform_crawl_schedule
                     (platform, next_crawl_at, crawl_interval_hours, enabled)
                 VALUES ($1, now(), $2, $3)
                 ON CONFLICT (platform) DO NOTHING",
                &[&platform, &interval_hours, &(interval_hours > 0)],
            )
            .await?;
        Ok(())
    }

    /// Persist a platform's cursor blob and advance its crawl timestamps.
    /// Runs at end-of-tick even when the crawl aborted on a circuit-open,
    /// so `last_crawl_at` always reflects the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn complete_platform_crawl(
        &self,
        platform: &str,
        cursors: &CursorState,
    ) -> Result<()> {
        let blob = cursors.to_json().map_err(|e| {
            crate::error::Error::Generic(format!("cursor serialization: {e}"))
        })?;
        self.client
            .execute(
                "UPDATE platform_crawl_schedule
                 SET last_crawl_at = now(),
                     next_crawl_at = now() + make_interval(hours => crawl_interval_hours),
                     search_terms = $2
                 WHERE platform = $1",
                &[&platform, &blob],
            )
            .await?;
        Ok(())
    }

    /// Set or clear the platform's current pipeline phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_crawl_phase(&self, platform: &str, phase: Option<&str>) -> Result<()> {
        self.client
            .execute(
                "UPDATE platform_crawl_schedule SET crawl_phase = $2 WHERE platform = $1",
                &[&platform, &phase],
            )
            .await?;
        Ok(())
    }

    /// Clear the pipeline phase on every enabled platform (detection and
    /// matching are shared stages, not per-platform).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn clear_all_crawl_phases(&self) -> Result<()> {
        self.client
            .execute(
                "UPDATE platform_crawl_schedule SET crawl_phase = NULL WHERE enabled = true",
                &[],
            )
            .await?;
        Ok(())
    }

    /// Update coverage counters after a crawl. `new_images` is the new-rows
    /// count from the batch insert — the single authoritative definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_crawl_coverage(
        &self,
        platform: &str,
        new_images: i32,
        tags_total: i32,
        tags_exhausted: i32,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE platform_crawl_schedule
                 SET total_images_discovered = total_images_discovered + $2,
                     tags_total = $3,
                     tags_exhausted = $4
                 WHERE platform = $1",
                &[&platform, &new_images, &tags_total, &tags_exhausted],
            )
            .await?;
        Ok(())
    }

    // --- Scan jobs ---

    /// Create a scan job and mark it running.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn start_scan_job(
        &self,
        scan_type: &str,
        source_name: &str,
        contributor_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let row = self
            .client
            .query_one(
                "INSERT INTO scan_jobs
                     (scan_type, source_name, contributor_id, status, started_at)
                 VALUES ($1, $2, $3, 'running', now())
                 RETURNING id",
                &[&scan_type, &source_name, &contributor_id],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Finish a scan job with counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn complete_scan_job(
        &self,
        job_id: Uuid,
        images_processed: i32,
        matches_found: i32,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE scan_jobs
                 SET status = 'completed',
                     images_processed = $2,
                     matches_found = $3,
                     completed_at = now()
                 WHERE id = $1",
                &[&job_id, &images_processed, &matches_found],
            )
            .await?;
        Ok(())
    }

    /// Fail a scan job with a truncated error message.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn fail_scan_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let truncated: String = error.chars().take(500).collect();
        self.client
            .execute(
                "UPDATE scan_jobs
                 SET status = 'failed', error_message = $2, completed_at = now()
                 WHERE id = $1",
                &[&job_id, &truncated],
            )
            .await?;
        Ok(())
    }

    /// Reclassify running/interrupted jobs older than the cutoff as failed
    /// with the `stale_job_recovered` marker. Runs at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn recover_stale_jobs(&self, max_age_minutes: i32) -> Result<u64> {
        let count = self
            .client
            .execute(
                "UPDATE scan_jobs
                 SET status = 'failed',
                     error_message = 'stale_job_recovered',
                     completed_at = now()
                 WHERE status IN ('running', 'interrupted')
                   AND started_at < now() - make_interval(mins => $1)",
                &[&max_age_minutes],
            )
            .await?;
        if count > 0 {
            info!(count, "stale jobs recovered");
        }
        Ok(count)
    }

    /// Mark all running jobs interrupted (graceful shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn interrupt_running_jobs(&self) -> Result<u64> {
        let count = self
            .client
            .execute(
                "UPDATE scan_jobs SET status = 'interrupted' WHERE status = 'running'",
                &[],
            )
            .await?;
        Ok(count)
    }

    /// Fetch one scan job's summary row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_scan_job(&self, job_id: Uuid) -> Result<Option<ScanJobRow>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, scan_type, status, source_name, images_processed,
                        matches_found, error_message, started_at, completed_at
                 FROM scan_jobs
                 WHERE id = $1",
                &[&job_id],
            )
            .await?;
        Ok(row.map(|row| ScanJobRow {
            id: row.get(0),
            scan_type: row.get(1),
            status: row.get(2),
            source_name: row.get(3),
            images_processed: row.get(4),
            matches_found: row.get(5),
            error_message: row.get(6),
            started_at: row.get(7),
            completed_at: row.get(8),
        }))
    }

    /// Set a job's status directly (admin-triggered single-stage runs).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_scan_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        self.client
            .execute(
                "UPDATE scan_jobs SET status = $2 WHERE id = $1",
                &[&job_id, &status.as_str()],
            )
            .await?;
        Ok(())
    }
}
