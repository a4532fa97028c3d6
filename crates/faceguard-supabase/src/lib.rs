//! # faceguard-supabase
//!
//! Supabase Storage client for the FaceGuard scanner.
//!
//! Three buckets are in play: contributor reference images (downloaded for
//! ingest), `discovered-images` (thumbnails the providers upload during
//! crawls), and the evidence bucket (screenshots with SHA-256 hashes).
//!
//! Paths follow the Supabase Storage REST surface:
//! - download: `GET {base}/storage/v1/object/authenticated/{bucket}/{path}`
//! - upload: `PUT {base}/storage/v1/object/{bucket}/{path}` with `x-upsert`

mod storage_client;

pub use storage_client::{EvidenceUpload, StorageClient, DISCOVERED_IMAGES_BUCKET};
