//! Authenticated Supabase Storage operations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use faceguard::download::{suffix_for_url, TempStore, MAX_FILE_SIZE};
use faceguard::error::{Error, Result};
use faceguard::ratelimit::TokenBucket;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bucket holding provider-uploaded thumbnails of discovered images.
pub const DISCOVERED_IMAGES_BUCKET: &str = "discovered-images";

/// Long-edge cap for stored thumbnails.
const THUMBNAIL_MAX_PX: u32 = 512;

/// Result of an evidence upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceUpload {
    pub storage_url: String,
    pub sha256_hash: String,
    pub file_size_bytes: i32,
}

/// Supabase Storage client authenticated with the service role key.
pub struct StorageClient {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
    rate_limiter: Option<Arc<TokenBucket>>,
}

impl StorageClient {
    /// Build a storage client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the endpoint or key is missing,
    /// or an HTTP error if the client cannot be built.
    pub fn new(base_url: &str, service_role_key: &str) -> Result<Self> {
        if base_url.is_empty() || service_role_key.is_empty() {
            return Err(Error::config("supabase storage credentials missing"));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(5))
                .user_agent("FaceGuard-Scanner/0.9")
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
            rate_limiter: None,
        })
    }

    /// Attach the `supabase_storage` token bucket to upload paths.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Authenticated download URL for a stored object (handed to the
    /// AI-classification provider for stored thumbnails).
    #[must_use]
    pub fn authenticated_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/authenticated/{bucket}/{path}",
            self.base_url
        )
    }

    /// Download an object to the scratch directory.
    ///
    /// # Errors
    ///
    /// Returns a storage error on non-2xx responses and an invalid-image
    /// error when the payload is not decodable.
    pub async fn download(&self, bucket: &str, path: &str, temp: &TempStore) -> Result<std::path::PathBuf> {
        let url = self.authenticated_url(bucket, path);
        let mut response = self
            .client
            .get(&url)
            .bearer_auth(&self.service_role_key)
            .header("apikey", &self.service_role_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(bucket, path, %status, "storage download failed");
            return Err(Error::storage(format!(
                "download {bucket}/{path} returned {status}"
            )));
        }

        let dest = temp.allocate(suffix_for_url(path));
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut total: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            total += chunk.len() as u64;
            if total > MAX_FILE_SIZE {
                drop(file);
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(Error::InvalidImage(format!(
                    "stored object {bucket}/{path} over size cap"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if image::image_dimensions(&dest).is_err() {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(Error::InvalidImage(format!(
                "stored object {bucket}/{path} is not a decodable image"
            )));
        }

        debug!(bucket, path, total, "storage object downloaded");
        Ok(dest)
    }

    /// Upload raw bytes with upsert semantics.
    ///
    /// # Errors
    ///
    /// Returns a storage error on non-2xx responses.
    pub async fn upload_bytes(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.service_role_key)
            .header("apikey", &self.service_role_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(bucket, path, %status, body = %body.chars().take(200).collect::<String>(),
                  "storage upload failed");
            return Err(Error::storage(format!(
                "upload {bucket}/{path} returned {status}"
            )));
        }
        Ok(())
    }

    /// Resize an image to the thumbnail cap, encode as JPEG, and upload
    /// under `{platform}/{uuid}.jpg` in the discovered-images bucket.
    /// Returns the storage key.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the upload fails.
    pub async fn upload_thumbnail(&self, image: &DynamicImage, platform: &str) -> Result<String> {
        let thumbnail = if image.width().max(image.height()) > THUMBNAIL_MAX_PX {
            image.thumbnail(THUMBNAIL_MAX_PX, THUMBNAIL_MAX_PX)
        } else {
            image.clone()
        };

        let mut encoded = std::io::Cursor::new(Vec::new());
        thumbnail
            .to_rgb8()
            .write_to(&mut encoded, image::ImageFormat::Jpeg)
            .map_err(|e| Error::storage(format!("thumbnail encode failed: {e}")))?;

        let storage_key = format!("{platform}/{}.jpg", Uuid::new_v4().simple());
        self.upload_bytes(
            DISCOVERED_IMAGES_BUCKET,
            &storage_key,
            encoded.into_inner(),
            "image/jpeg",
        )
        .await?;
        Ok(storage_key)
    }

    /// Upload a captured evidence file, returning its storage URL, SHA-256
    /// hash, and byte size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the upload fails.
    pub async fn upload_evidence(
        &self,
        local_path: &Path,
        bucket: &str,
        contributor_id: Uuid,
        match_id: Uuid,
    ) -> Result<EvidenceUpload> {
        let bytes = tokio::fs::read(local_path).await?;
        let sha256_hash = hex::encode(Sha256::digest(&bytes));
        let file_size_bytes = i32::try_from(bytes.len())
            .map_err(|_| Error::storage("evidence file too large".to_string()))?;

        let storage_key = format!(
            "{contributor_id}/{match_id}/{}.png",
            Uuid::new_v4().simple()
        );
        self.upload_bytes(bucket, &storage_key, bytes, "image/png").await?;

        Ok(EvidenceUpload {
            storage_url: self.authenticated_url(bucket, &storage_key),
            sha256_hash,
            file_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use wiremock::matchers::{header, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let buf = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 64u8])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(buf)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn temp_store() -> (tempfile::TempDir, TempStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().join("scratch")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_requires_credentials() {
        assert!(StorageClient::new("", "key").is_err());
        assert!(StorageClient::new("https://proj.supabase.co", "").is_err());
        assert!(StorageClient::new("https://proj.supabase.co", "key").is_ok());
    }

    #[test]
    fn test_authenticated_url_shape() {
        let client = StorageClient::new("https://proj.supabase.co/", "key").unwrap();
        assert_eq!(
            client.authenticated_url("discovered-images", "civitai/abc.jpg"),
            "https://proj.supabase.co/storage/v1/object/authenticated/discovered-images/civitai/abc.jpg"
        );
    }

    #[tokio::test]
    async fn test_download_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(
                r"^/storage/v1/object/authenticated/contributor-images/alice/selfie\.jpg$",
            ))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_bytes(256, 256)))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let path = client
            .download("contributor-images", "alice/selfie.jpg", &temp)
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(image::image_dimensions(&path).unwrap(), (256, 256));
    }

    #[tokio::test]
    async fn test_download_non_2xx_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let err = client
            .download("contributor-images", "missing.jpg", &temp)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_undecodable_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not an image".to_vec()))
            .mount(&server)
            .await;

        let (_guard, temp) = temp_store();
        let scratch = temp.dir().to_path_buf();
        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let err = client
            .download("contributor-images", "corrupt.jpg", &temp)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
        // Failed downloads leave no temp files behind.
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_bytes_sets_upsert_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/storage/v1/object/discovered-images/civitai/.*\.jpg$"))
            .and(header("x-upsert", "true"))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        client
            .upload_bytes(
                "discovered-images",
                "civitai/x.jpg",
                jpeg_bytes(64, 64),
                "image/jpeg",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_thumbnail_returns_platform_key() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let big = DynamicImage::ImageRgb8(ImageBuffer::from_fn(1024, 768, |_, _| {
            Rgb([10u8, 20u8, 30u8])
        }));
        let key = client.upload_thumbnail(&big, "civitai").await.unwrap();
        assert!(key.starts_with("civitai/"));
        assert!(key.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_upload_evidence_hashes_content() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot.png");
        std::fs::write(&shot, b"screenshot-bytes").unwrap();

        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let upload = client
            .upload_evidence(&shot, "madeofus-evidence", Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();

        let expected = hex::encode(Sha256::digest(b"screenshot-bytes"));
        assert_eq!(upload.sha256_hash, expected);
        assert_eq!(upload.file_size_bytes, 16);
        assert!(upload.storage_url.contains("/madeofus-evidence/"));
    }

    #[tokio::test]
    async fn test_upload_failure_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let client = StorageClient::new(&server.uri(), "service-key").unwrap();
        let err = client
            .upload_bytes("discovered-images", "x.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
