//! Scanner-owned schema bootstrap.
//!
//! The contributor tables (`contributors`, `contributor_images`,
//! `contributor_known_accounts`) are owned by the web application; the
//! scanner only reads them. Everything below `-- scanner-owned` is created
//! here so a fresh environment can run the pipeline end to end.

use tracing::debug;

use crate::client::ScannerDb;
use crate::error::Result;

const SCHEMA_SQL: &str = r"
CREATE EXTENSION IF NOT EXISTS vector;

-- web-app-owned (created here only for fresh dev environments)
CREATE TABLE IF NOT EXISTS contributors (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    full_name TEXT,
    subscription_tier TEXT NOT NULL DEFAULT 'free',
    onboarding_completed BOOLEAN NOT NULL DEFAULT false,
    opted_out BOOLEAN NOT NULL DEFAULT false,
    suspended BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS contributor_images (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    capture_step TEXT,
    file_path TEXT,
    bucket TEXT,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    embedding_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS contributor_known_accounts (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    platform TEXT,
    handle TEXT,
    domain TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- scanner-owned
CREATE TABLE IF NOT EXISTS contributor_embeddings (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    source_image_id UUID REFERENCES contributor_images(id) ON DELETE CASCADE,
    embedding vector(512) NOT NULL,
    detection_score DOUBLE PRECISION,
    is_primary BOOLEAN NOT NULL DEFAULT false,
    embedding_type TEXT NOT NULL DEFAULT 'single',
    centroid_metadata JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS registry_identities (
    cid TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'claimed',
    face_embedding vector(512),
    selfie_bucket TEXT,
    selfie_path TEXT,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    embedding_error TEXT,
    detection_score DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS scan_jobs (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    contributor_id UUID REFERENCES contributors(id) ON DELETE CASCADE,
    scan_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    source_name TEXT,
    stage TEXT,
    images_processed INTEGER NOT NULL DEFAULT 0,
    matches_found INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS scan_schedule (
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    scan_type TEXT NOT NULL,
    last_scan_at TIMESTAMPTZ,
    next_scan_at TIMESTAMPTZ,
    scan_interval_hours INTEGER NOT NULL DEFAULT 168,
    priority INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (contributor_id, scan_type)
);

CREATE TABLE IF NOT EXISTS platform_crawl_schedule (
    platform TEXT PRIMARY KEY,
    last_crawl_at TIMESTAMPTZ,
    next_crawl_at TIMESTAMPTZ,
    crawl_interval_hours INTEGER NOT NULL DEFAULT 24,
    enabled BOOLEAN NOT NULL DEFAULT true,
    search_terms JSONB,
    crawl_phase TEXT,
    total_images_discovered INTEGER NOT NULL DEFAULT 0,
    tags_total INTEGER NOT NULL DEFAULT 0,
    tags_exhausted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS discovered_images (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    scan_job_id UUID REFERENCES scan_jobs(id) ON DELETE SET NULL,
    source_url TEXT NOT NULL,
    page_url TEXT,
    page_title TEXT,
    platform TEXT,
    image_stored_url TEXT,
    has_face BOOLEAN,
    face_count INTEGER,
    phash BIT(64),
    width INTEGER,
    height INTEGER,
    discovered_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- URL dedup: hash of the URL keeps the unique index compact
CREATE UNIQUE INDEX IF NOT EXISTS idx_discovered_images_source_url_md5
    ON discovered_images (md5(source_url));
CREATE INDEX IF NOT EXISTS idx_discovered_images_has_face
    ON discovered_images (discovered_at DESC) WHERE has_face IS NULL;

CREATE TABLE IF NOT EXISTS discovered_face_embeddings (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    discovered_image_id UUID NOT NULL REFERENCES discovered_images(id) ON DELETE CASCADE,
    face_index INTEGER NOT NULL DEFAULT 0,
    embedding vector(512) NOT NULL,
    detection_score DOUBLE PRECISION,
    matched_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (discovered_image_id, face_index)
);

CREATE TABLE IF NOT EXISTS matches (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    discovered_image_id UUID NOT NULL REFERENCES discovered_images(id) ON DELETE CASCADE,
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    similarity_score DOUBLE PRECISION NOT NULL,
    confidence_tier TEXT NOT NULL,
    best_embedding_id UUID REFERENCES contributor_embeddings(id),
    face_index INTEGER NOT NULL DEFAULT 0,
    source_account TEXT,
    is_known_account BOOLEAN NOT NULL DEFAULT false,
    known_account_id UUID REFERENCES contributor_known_accounts(id),
    is_ai_generated BOOLEAN,
    ai_detection_score DOUBLE PRECISION,
    ai_generator TEXT,
    status TEXT NOT NULL DEFAULT 'new',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (discovered_image_id, contributor_id)
);

CREATE TABLE IF NOT EXISTS registry_matches (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    cid TEXT NOT NULL,
    discovered_image_id UUID REFERENCES discovered_images(id) ON DELETE SET NULL,
    source_url TEXT,
    page_url TEXT,
    platform TEXT,
    similarity_score DOUBLE PRECISION NOT NULL,
    confidence_tier TEXT NOT NULL,
    face_index INTEGER NOT NULL DEFAULT 0,
    discovered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (cid, discovered_image_id, face_index)
);

CREATE TABLE IF NOT EXISTS evidence (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    match_id UUID NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
    evidence_type TEXT NOT NULL,
    storage_url TEXT NOT NULL,
    sha256_hash TEXT NOT NULL,
    file_size_bytes INTEGER,
    captured_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS scanner_notifications (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    contributor_id UUID NOT NULL REFERENCES contributors(id) ON DELETE CASCADE,
    notification_type TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    data JSONB,
    read BOOLEAN NOT NULL DEFAULT false,
    sent BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- mutable ML state (similarity thresholds live here, not in code)
CREATE TABLE IF NOT EXISTS ml_state (
    key TEXT PRIMARY KEY,
    value JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

impl ScannerDb {
    /// Create scanner-owned tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails (including a missing
    /// pgvector extension).
    pub async fn ensure_schema(&self) -> Result<()> {
        self.client.batch_execute(SCHEMA_SQL).await?;
        debug!("scanner schema ensured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_vector_columns() {
        assert!(SCHEMA_SQL.contains("embedding vector(512) NOT NULL"));
        assert!(SCHEMA_SQL.contains("face_embedding vector(512)"));
    }

    #[test]
    fn test_schema_dedup_indexes() {
        // URL dedup hashes the source URL; match dedup pairs image with
        // contributor; face embeddings dedup on (image, face_index).
        assert!(SCHEMA_SQL.contains("md5(source_url)"));
        assert!(SCHEMA_SQL.contains("UNIQUE (discovered_image_id, contributor_id)"));
        assert!(SCHEMA_SQL.contains("UNIQUE (discovered_image_id, face_index)"));
        assert!(SCHEMA_SQL.contains("UNIQUE (cid, discovered_image_id, face_index)"));
    }

    #[test]
    fn test_schema_phash_is_64_bit() {
        assert!(SCHEMA_SQL.contains("phash BIT(64)"));
    }
}
