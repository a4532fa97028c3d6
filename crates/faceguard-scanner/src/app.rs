//! Process-wide context: configuration, connections, providers, and the
//! cooperative shutdown flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use faceguard::breaker::BreakerRegistry;
use faceguard::config::Config;
use faceguard::detector::FaceDetector;
use faceguard::discovery::DiscoverySource;
use faceguard::download::{ImageDownloader, TempStore};
use faceguard::error::Result;
use faceguard::ratelimit::RateLimiterRegistry;
use faceguard_civitai::{CivitaiConfig, CivitaiCrawl};
use faceguard_db::ScannerDb;
use faceguard_deviantart::{DeviantArtConfig, DeviantArtCrawl};
use faceguard_hive::HiveClient;
use faceguard_supabase::StorageClient;
use faceguard_tineye::TinEyeClient;
use tokio::sync::{Notify, OnceCell};
use tracing::{info, warn};

use crate::detector::build_detector;
use crate::evidence::{BrowserScreenshotter, ScreenshotClient};
use crate::hooks::PipelineHooks;

/// Cooperative shutdown signal, observed at outer-loop iterations and batch
/// boundaries within workstreams.
#[derive(Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Everything the workstreams share. The database is the only shared
/// mutable state; everything else here is configuration and clients.
pub struct ScannerContext {
    pub config: Config,
    pub db: Arc<ScannerDb>,
    pub storage: Option<Arc<StorageClient>>,
    pub downloader: Arc<ImageDownloader>,
    pub temp: TempStore,
    pub limiters: Arc<RateLimiterRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub providers: HashMap<String, Arc<dyn DiscoverySource>>,
    pub tineye: Option<Arc<TinEyeClient>>,
    pub hive: Option<Arc<HiveClient>>,
    pub hooks: PipelineHooks,
    pub shutdown: Arc<Shutdown>,
    detector: OnceCell<Arc<dyn FaceDetector>>,
    screenshotter: OnceCell<Option<Arc<dyn ScreenshotClient>>>,
}

impl ScannerContext {
    /// Connect, ensure schema and crawl schedules, and build every
    /// configured provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or a mandatory client cannot be
    /// initialized.
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        let db = Arc::new(ScannerDb::connect(&config.database_url, config.database_ssl).await?);
        db.ensure_schema().await?;

        let temp = TempStore::new(&config.temp_dir)?;
        let proxy = (!config.proxy_url.is_empty()).then(|| config.proxy_url.clone());
        let downloader = Arc::new(ImageDownloader::new(temp.clone(), proxy.as_deref())?);

        let limiters = Arc::new(RateLimiterRegistry::new());
        let breakers = Arc::new(BreakerRegistry::new());

        let storage = match StorageClient::new(&config.supabase_url, &config.supabase_service_role_key)
        {
            Ok(client) => Some(Arc::new(
                client.with_rate_limiter(limiters.get("supabase_storage").await),
            )),
            Err(e) => {
                warn!(error = %e, "object storage disabled");
                None
            }
        };

        let mut providers: HashMap<String, Arc<dyn DiscoverySource>> = HashMap::new();

        let civitai = CivitaiCrawl::new(
            CivitaiConfig {
                max_pages: config.civitai_max_pages,
                model_pages_per_tag: config.civitai_model_pages_per_tag,
                nsfw_filter: config.civitai_nsfw_filter.clone(),
                ..CivitaiConfig::default()
            },
            limiters.get("civitai").await,
            breakers.get("civitai").await,
            Arc::clone(&downloader),
            storage.clone(),
        )?;
        providers.insert("civitai".to_string(), Arc::new(civitai));

        if !config.deviantart_client_id.is_empty() {
            let deviantart = DeviantArtCrawl::new(
                DeviantArtConfig {
                    client_id: config.deviantart_client_id.clone(),
                    client_secret: config.deviantart_client_secret.clone(),
                    max_pages: config.deviantart_max_pages,
                    high_damage_pages: config.deviantart_high_damage_pages,
                    medium_damage_pages: config.deviantart_medium_damage_pages,
                    low_damage_pages: config.deviantart_low_damage_pages,
                    ..DeviantArtConfig::default()
                },
                limiters.get("deviantart").await,
                breakers.get("deviantart").await,
            )?;
            providers.insert("deviantart".to_string(), Arc::new(deviantart));
        } else {
            info!("deviantart credentials absent; provider disabled");
        }

        // Register schedules for every enabled provider; intervals of zero
        // leave the platform manual-only.
        db.ensure_platform_schedule("civitai", config.civitai_crawl_interval_hours as i32)
            .await?;
        if providers.contains_key("deviantart") {
            db.ensure_platform_schedule(
                "deviantart",
                config.deviantart_crawl_interval_hours as i32,
            )
            .await?;
        }

        let tineye = if config.tineye_api_key.is_empty() {
            info!("tineye key absent; reverse-image scans disabled");
            None
        } else {
            Some(Arc::new(TinEyeClient::new(
                "https://api.tineye.com",
                &config.tineye_api_key,
                limiters.get("tineye").await,
                breakers.get("tineye").await,
            )?))
        };

        let hive = if config.hive_api_key.is_empty() {
            info!("hive key absent; AI classification disabled");
            None
        } else {
            Some(Arc::new(HiveClient::new(
                "https://api.thehive.ai/api/v2",
                &config.hive_api_key,
                limiters.get("hive").await,
            )?))
        };

        Ok(Arc::new(Self {
            config,
            db,
            storage,
            downloader,
            temp,
            limiters,
            breakers,
            providers,
            tineye,
            hive,
            hooks: PipelineHooks::default(),
            shutdown: Arc::new(Shutdown::new()),
            detector: OnceCell::new(),
            screenshotter: OnceCell::new(),
        }))
    }

    /// The process-wide face detector, initialized on first use (inline
    /// crawls and ingest share it; the deferred worker builds its own in the
    /// child process).
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be built or initialized.
    pub async fn detector(&self) -> Result<Arc<dyn FaceDetector>> {
        self.detector
            .get_or_try_init(|| async {
                let detector = build_detector(&self.config)?;
                detector.init(Some(&self.config.insightface_model)).await?;
                Ok(detector)
            })
            .await
            .map(Arc::clone)
    }

    /// The process-wide screenshot client, lazily initialized; `None` when
    /// evidence capture is not configured.
    pub async fn screenshotter(&self) -> Option<Arc<dyn ScreenshotClient>> {
        self.screenshotter
            .get_or_init(|| async {
                if self.config.screenshot_service_url.is_empty() {
                    info!("screenshot service absent; evidence capture disabled");
                    return None;
                }
                match BrowserScreenshotter::new(
                    &self.config.screenshot_service_url,
                    self.temp.clone(),
                ) {
                    Ok(client) => Some(Arc::new(client) as Arc<dyn ScreenshotClient>),
                    Err(e) => {
                        warn!(error = %e, "screenshot service unavailable");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Close process-wide singletons on shutdown.
    pub async fn shutdown_clients(&self) {
        if let Some(Some(screenshotter)) = self.screenshotter.get() {
            screenshotter.shutdown().await;
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
