//! Retention policies. All deletes are LIMIT-batched to avoid long-running
//! transactions on the shared database.

use crate::client::ScannerDb;
use crate::error::Result;
use crate::rows::CleanupCounts;

/// Rows per delete statement.
const DELETE_BATCH_SIZE: i64 = 10_000;

/// Retention windows, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Discovered images probed with no face.
    pub no_face_days: i32,
    /// Face-positive images with no match and no embedding children.
    pub no_match_days: i32,
    /// Discovered face embeddings (the backfill window).
    pub face_embedding_days: i32,
    /// Completed/failed scan jobs.
    pub finished_job_days: i32,
    /// Read notifications.
    pub read_notification_days: i32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            no_face_days: 7,
            no_match_days: 30,
            face_embedding_days: 60,
            finished_job_days: 30,
            read_notification_days: 90,
        }
    }
}

impl ScannerDb {
    /// Run one hourly cleanup pass. Returns per-table delete counts.
    ///
    /// # Errors
    ///
    /// Returns an error if any delete fails.
    pub async fn run_cleanup(&self, policy: RetentionPolicy) -> Result<CleanupCounts> {
        let mut counts = CleanupCounts::default();

        counts.no_face_images = self
            .client
            .execute(
                "DELETE FROM discovered_images
                 WHERE id IN (
                     SELECT id FROM discovered_images
                     WHERE has_face = false
                       AND discovered_at < now() - make_interval(days => $1)
                     LIMIT $2
                 )",
                &[&policy.no_face_days, &DELETE_BATCH_SIZE],
            )
            .await?;

        counts.unmatched_images = self
            .client
            .execute(
                "DELETE FROM discovered_images
                 WHERE id IN (
                     SELECT di.id FROM discovered_images di
                     LEFT JOIN matches m ON m.discovered_image_id = di.id
                     LEFT JOIN discovered_face_embeddings dfe
                            ON dfe.discovered_image_id = di.id
                     WHERE di.has_face = true
                       AND m.id IS NULL
                       AND dfe.id IS NULL
                       AND di.discovered_at < now() - make_interval(days => $1)
                     LIMIT $2
                 )",
                &[&policy.no_match_days, &DELETE_BATCH_SIZE],
            )
            .await?;

        counts.face_embeddings = self
            .client
            .execute(
                "DELETE FROM discovered_face_embeddings
                 WHERE id IN (
                     SELECT id FROM discovered_face_embeddings
                     WHERE created_at < now() - make_interval(days => $1)
                     LIMIT $2
                 )",
                &[&policy.face_embedding_days, &DELETE_BATCH_SIZE],
            )
            .await?;

        counts.finished_jobs = self
            .client
            .execute(
                "DELETE FROM scan_jobs
                 WHERE id IN (
                     SELECT id FROM scan_jobs
                     WHERE status IN ('completed', 'failed')
                       AND completed_at < now() - make_interval(days => $1)
                     LIMIT $2
                 )",
                &[&policy.finished_job_days, &DELETE_BATCH_SIZE],
            )
            .await?;

        counts.read_notifications = self
            .client
            .execute(
                "DELETE FROM scanner_notifications
                 WHERE id IN (
                     SELECT id FROM scanner_notifications
                     WHERE read = true
                       AND created_at < now() - make_interval(days => $1)
                     LIMIT $2
                 )",
                &[&policy.read_notification_days, &DELETE_BATCH_SIZE],
            )
            .await?;

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retention_windows() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.no_face_days, 7);
        assert_eq!(policy.no_match_days, 30);
        assert_eq!(policy.face_embedding_days, 60);
        assert_eq!(policy.finished_job_days, 30);
        assert_eq!(policy.read_notification_days, 90);
    }
}
