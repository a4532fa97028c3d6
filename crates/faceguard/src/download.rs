//! Resilient image downloading with validation and temp-file management.
//!
//! Every remote image passes the same pre-filters before face detection:
//! 2xx status, a Content-Type that is not explicitly video/text/JSON, image
//! magic bytes, a byte-size floor and ceiling, and minimum decoded
//! dimensions. Downloads stream to the scratch directory under a global
//! concurrency cap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use image::{imageops::FilterType, DynamicImage};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Hard ceiling on downloaded file size.
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Floor below which a payload is not a plausible photograph.
pub const MIN_FILE_SIZE: u64 = 1000;

/// Per-request download timeout.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-edge target when resizing for face detection.
pub const RESIZE_TARGET: u32 = 4096;

/// Minimum decoded width/height for face detection.
pub const MIN_DIMENSION: u32 = 200;

/// Global cap on concurrent image downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 5;

/// Two-byte magic prefixes for JPEG, PNG, WebP (RIFF), GIF, BMP.
pub const IMAGE_MAGIC_PREFIXES: [[u8; 2]; 5] =
    [[0xFF, 0xD8], [0x89, b'P'], [b'R', b'I'], [b'G', b'I'], [b'B', b'M']];

/// Returns false if the Content-Type is definitely not an image.
#[must_use]
pub fn check_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else { return true };
    let ct = ct.split(';').next().unwrap_or("").trim().to_lowercase();
    !(ct.starts_with("video/") || ct.starts_with("text/") || ct == "application/json")
}

/// Returns true if the first bytes match a known image format.
#[must_use]
pub fn check_magic_bytes(data: &[u8]) -> bool {
    data.len() >= 2 && IMAGE_MAGIC_PREFIXES.iter().any(|p| data[..2] == p[..])
}

/// File extension inferred from a URL path, defaulting to `.jpg`.
#[must_use]
pub fn suffix_for_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => ".jpg",
        "png" => ".png",
        "webp" => ".webp",
        "gif" => ".gif",
        "bmp" => ".bmp",
        _ => ".jpg",
    }
}

/// Scratch-directory manager for downloaded images.
#[derive(Debug, Clone)]
pub struct TempStore {
    dir: PathBuf,
}

impl TempStore {
    /// Create the scratch directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh unique path with the given suffix.
    #[must_use]
    pub fn allocate(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", Uuid::new_v4().simple()))
    }

    /// Delete files older than `max_age`. Returns the count deleted.
    #[must_use]
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let cutoff = SystemTime::now() - max_age;
        let mut deleted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
        deleted
    }
}

/// A validated image sitting in the scratch directory.
#[derive(Debug)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl DownloadedImage {
    /// Whether the decoded dimensions meet the detection floor.
    #[must_use]
    pub fn meets_min_dimensions(&self) -> bool {
        self.width >= MIN_DIMENSION && self.height >= MIN_DIMENSION
    }

    /// Delete the temp file. Errors are ignored; the temp-file GC sweeps
    /// leftovers.
    pub async fn cleanup(self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// Bounded-concurrency HTTP image fetcher.
pub struct ImageDownloader {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    temp: TempStore,
}

impl ImageDownloader {
    /// Build a downloader with the standard timeouts and an optional proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or scratch directory cannot be
    /// created.
    pub fn new(temp: TempStore, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent("FaceGuard-Scanner/0.9")
            .timeout(DOWNLOAD_TIMEOUT)
            .connect_timeout(Duration::from_secs(5));
        if let Some(proxy) = proxy_url.filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS)),
            temp,
        })
    }

    #[must_use]
    pub fn temp(&self) -> &TempStore {
        &self.temp
    }

    /// Download a single image URL through the pre-filters.
    ///
    /// # Errors
    ///
    /// `Error::InvalidImage` when any validation fails (terminal for that
    /// image), `Error::Http` on transport failures.
    pub async fn fetch(&self, url: &str) -> Result<DownloadedImage> {
        #[allow(clippy::expect_used)] // semaphore is never closed
        let _permit = self.semaphore.acquire().await.expect("download semaphore closed");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::InvalidImage(format!("HTTP status {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_FILE_SIZE {
                return Err(Error::InvalidImage(format!("content length {len} over cap")));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if !check_content_type(content_type.as_deref()) {
            return Err(Error::InvalidImage(format!(
                "content type {}",
                content_type.unwrap_or_default()
            )));
        }

        let dest = self.temp.allocate(suffix_for_url(url));
        match self.stream_to_file(response, &dest).await {
            Ok(image) => Ok(image),
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e)
            }
        }
    }

    async fn stream_to_file(
        &self,
        mut response: reqwest::Response,
        dest: &Path,
    ) -> Result<DownloadedImage> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut head: Vec<u8> = Vec::with_capacity(4);
        let mut total: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            total += chunk.len() as u64;
            if total > MAX_FILE_SIZE {
                return Err(Error::InvalidImage(format!("exceeded {MAX_FILE_SIZE} bytes")));
            }
            if head.len() < 4 {
                head.extend_from_slice(&chunk[..chunk.len().min(4 - head.len())]);
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if total < MIN_FILE_SIZE {
            return Err(Error::InvalidImage(format!("{total} bytes below floor")));
        }
        if !check_magic_bytes(&head) {
            return Err(Error::InvalidImage("magic bytes mismatch".to_string()));
        }

        let (width, height) = image::image_dimensions(dest)
            .map_err(|e| Error::InvalidImage(format!("undecodable image: {e}")))?;

        debug!(path = %dest.display(), total, width, height, "image downloaded");
        Ok(DownloadedImage {
            path: dest.to_path_buf(),
            width,
            height,
        })
    }
}

/// Load an image from disk, downscaling so the long edge fits `max_edge`.
///
/// # Errors
///
/// `Error::InvalidImage` if the file cannot be decoded.
pub fn load_and_resize(path: &Path, max_edge: u32) -> Result<DynamicImage> {
    let img = image::open(path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "image decode failed");
        Error::InvalidImage(format!("decode failed: {e}"))
    })?;
    let (w, h) = (img.width(), img.height());
    if w.max(h) > max_edge {
        let scale = f64::from(max_edge) / f64::from(w.max(h));
        let nw = (f64::from(w) * scale) as u32;
        let nh = (f64::from(h) * scale) as u32;
        Ok(img.resize_exact(nw.max(1), nh.max(1), FilterType::Triangle))
    } else {
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let buf = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 100u8])
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

    // ========== Content-Type pre-filter ==========

    #[test]
    fn test_content_type_none_allowed() {
        assert!(check_content_type(None));
    }

    #[test]
    fn test_content_type_images_allowed() {
        assert!(check_content_type(Some("image/jpeg")));
        assert!(check_content_type(Some("image/png")));
        assert!(check_content_type(Some("image/webp; charset=binary")));
        assert!(check_content_type(Some("application/octet-stream")));
    }

    #[test]
    fn test_content_type_rejects_video_text_json() {
        assert!(!check_content_type(Some("video/mp4")));
        assert!(!check_content_type(Some("text/html")));
        assert!(!check_content_type(Some("text/plain")));
        assert!(!check_content_type(Some("application/json")));
    }

    #[test]
    fn test_content_type_case_insensitive() {
        assert!(!check_content_type(Some("Video/MP4")));
        assert!(!check_content_type(Some("TEXT/HTML; charset=utf-8")));
    }

    // ========== Magic bytes ==========

    #[test]
    fn test_magic_bytes_known_formats() {
        assert!(check_magic_bytes(&[0xFF, 0xD8, 0xFF, 0xE0])); // JPEG
        assert!(check_magic_bytes(b"\x89PNG"));
        assert!(check_magic_bytes(b"RIFF")); // WebP container
        assert!(check_magic_bytes(b"GIF89a"));
        assert!(check_magic_bytes(b"BM\x00\x00"));
    }

    #[test]
    fn test_magic_bytes_rejects_non_images() {
        assert!(!check_magic_bytes(b"<html>"));
        assert!(!check_magic_bytes(b"{\"a\":1}"));
        assert!(!check_magic_bytes(b""));
        assert!(!check_magic_bytes(b"\xFF"));
    }

    // ========== Suffix ==========

    #[test]
    fn test_suffix_for_url() {
        assert_eq!(suffix_for_url("https://a.com/photo.PNG"), ".png");
        assert_eq!(suffix_for_url("https://a.com/photo.jpeg?w=450"), ".jpg");
        assert_eq!(suffix_for_url("https://a.com/photo.webp#frag"), ".webp");
        assert_eq!(suffix_for_url("https://a.com/noext"), ".jpg");
        assert_eq!(suffix_for_url("https://a.com/archive.zip"), ".jpg");
    }

    // ========== TempStore ==========

    #[test]
    fn test_temp_store_allocates_unique_paths() {
        let (_guard, store) = temp_store();
        let a = store.allocate(".jpg");
        let b = store.allocate(".jpg");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".jpg"));
    }

    #[test]
    fn test_temp_store_cleanup_old() {
        let (_guard, store) = temp_store();
        let stale = store.allocate(".jpg");
        std::fs::write(&stale, b"stale").unwrap();
        // Zero max-age: everything already on disk is stale.
        let deleted = store.cleanup_old(Duration::from_secs(0));
        assert_eq!(deleted, 1);
        assert!(!stale.exists());
    }

    #[test]
    fn test_temp_store_cleanup_keeps_fresh() {
        let (_guard, store) = temp_store();
        let fresh = store.allocate(".jpg");
        std::fs::write(&fresh, b"fresh").unwrap();
        let deleted = store.cleanup_old(Duration::from_secs(300));
        assert_eq!(deleted, 0);
        assert!(fresh.exists());
    }

    // ========== Downloader ==========

    #[tokio::test]
    async fn test_fetch_valid_jpeg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(jpeg_bytes(320, 240)),
            )
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let downloader = ImageDownloader::new(store, None).unwrap();
        let image = downloader
            .fetch(&format!("{}/a.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(image.width, 320);
        assert_eq!(image.height, 240);
        assert!(image.meets_min_dimensions());
        assert!(image.path.exists());
        image.cleanup().await;
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let downloader = ImageDownloader::new(store, None).unwrap();
        let err = downloader
            .fetch(&format!("{}/gone.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_video_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(vec![0u8; 5000]),
            )
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let downloader = ImageDownloader::new(store, None).unwrap();
        let err = downloader
            .fetch(&format!("{}/clip.mp4", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_magic_bytes() {
        let server = MockServer::start().await;
        let mut body = b"<html>definitely not an image".to_vec();
        body.resize(2000, b' ');
        Mock::given(method("GET"))
            .and(path("/fake.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let downloader = ImageDownloader::new(store, None).unwrap();
        let err = downloader
            .fetch(&format!("{}/fake.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_tiny_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tiny.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let downloader = ImageDownloader::new(store, None).unwrap();
        let err = downloader
            .fetch(&format!("{}/tiny.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_fetch_cleans_temp_file_on_failure() {
        let server = MockServer::start().await;
        let mut body = b"junk".to_vec();
        body.resize(2000, b'x');
        Mock::given(method("GET"))
            .and(path("/junk.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let (_guard, store) = temp_store();
        let scratch = store.dir().to_path_buf();
        let downloader = ImageDownloader::new(store, None).unwrap();
        downloader
            .fetch(&format!("{}/junk.jpg", server.uri()))
            .await
            .unwrap_err();
        let leftovers = std::fs::read_dir(&scratch).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    // ========== load_and_resize ==========

    #[test]
    fn test_load_and_resize_under_limit_unchanged() {
        let (_guard, store) = temp_store();
        let path = store.allocate(".jpg");
        std::fs::write(&path, jpeg_bytes(300, 200)).unwrap();
        let img = load_and_resize(&path, 4096).unwrap();
        assert_eq!((img.width(), img.height()), (300, 200));
    }

    #[test]
    fn test_load_and_resize_scales_long_edge() {
        let (_guard, store) = temp_store();
        let path = store.allocate(".jpg");
        std::fs::write(&path, jpeg_bytes(800, 400)).unwrap();
        let img = load_and_resize(&path, 400).unwrap();
        assert_eq!(img.width(), 400);
        assert_eq!(img.height(), 200);
    }

    #[test]
    fn test_load_and_resize_rejects_garbage() {
        let (_guard, store) = temp_store();
        let path = store.allocate(".jpg");
        std::fs::write(&path, b"not an image at all").unwrap();
        assert!(load_and_resize(&path, 4096).is_err());
    }
}
