use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::GenericImageView;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use crate::blobs::{is_object_url, BlobStore};
use crate::cache::compression::reduction_percent;
use crate::cache::{CacheEntry, CachedSource, CompressionCache, CompressionStats, Lookup};
use crate::config::{CompressionConfig, ConfigError};
use crate::images::{CompressedImage, CompressionSettings, ImageCodec, ImageError, ImageFetcher, LossyCodec};
use crate::interceptor::eligibility::{opt_out, Eligibility, EligibilityFilter};
use crate::interceptor::{ImageLoader, ImageTarget};

enum Outcome {
    /// Both natural dimensions are under the minimums.
    Skipped { width: u32, height: u32 },
    Compressed { image: CompressedImage, original_size: u64 },
}

/// Compressing image loader with a per-URL result cache.
///
/// Cloning is cheap and every clone shares one cache. Pipelines are spawned
/// on the ambient tokio runtime; assigning outside a runtime degrades to a
/// plain pass-through.
#[derive(Clone)]
pub struct ImageCompressionService {
    inner: Arc<Inner>,
}

struct Inner {
    config: CompressionConfig,
    settings: CompressionSettings,
    filter: EligibilityFilter,
    fetcher: Arc<dyn ImageFetcher>,
    codec: Arc<dyn ImageCodec>,
    blobs: Arc<dyn BlobStore>,
    cache: CompressionCache,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    running: AtomicBool,
}

impl ImageCompressionService {
    pub fn new(
        config: CompressionConfig,
        fetcher: Arc<dyn ImageFetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_codec(config, fetcher, Arc::new(LossyCodec), blobs)
    }

    pub fn with_codec(
        config: CompressionConfig,
        fetcher: Arc<dyn ImageFetcher>,
        codec: Arc<dyn ImageCodec>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let filter = EligibilityFilter::new(&config)?;
        let settings = CompressionSettings::from(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                settings,
                filter,
                fetcher,
                codec,
                blobs,
                cache: CompressionCache::new(),
                tasks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
            }),
        })
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CompressionStats {
        self.inner.cache.stats()
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.inner.cache.get(url).is_some()
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.inner.cache.is_in_flight(url)
    }

    pub fn cached_entry(&self, url: &str) -> Option<CacheEntry> {
        self.inner.cache.get(url)
    }

    pub fn opt_out(&self, url: &str) -> String {
        opt_out(url, &self.inner.config.opt_out_marker())
    }

    /// Resolves once every running pipeline has settled.
    pub async fn wait_idle(&self) {
        self.inner.cache.wait_idle().await
    }

    /// Stops intercepting and releases every compressed handle.
    ///
    /// Running pipelines are aborted and whoever was waiting on them gets
    /// the original URL. Calling this again does nothing.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain().map(|(_, task)| task).collect();
        let aborted = tasks.len();
        for task in tasks {
            task.abort();
        }

        let closed = self.inner.cache.close();
        for (url, targets) in closed.in_flight {
            for target in targets {
                target.set_src(&url);
            }
        }

        let mut released = 0;
        for (_, entry) in closed.entries {
            if self.inner.release(&entry.source) {
                released += 1;
            }
        }

        log::info!(
            "Image compression stopped: {} pipelines aborted, {} compressed images released",
            aborted,
            released
        );
    }

    fn assign_in_flight(&self, target: Arc<dyn ImageTarget>, url: &str) {
        if self.inner.config.coalesce_in_flight {
            match self.inner.cache.add_waiter(url, target) {
                Ok(()) => {
                    log::debug!("Queued {} behind its running compression", url);
                    return;
                }
                // Settled in the meantime
                Err(target) => {
                    match self.inner.cache.lookup(url) {
                        Lookup::Cached(src) => target.set_src(&src),
                        _ => target.set_src(url),
                    }
                    return;
                }
            }
        }

        log::debug!("{} is already being compressed, using the original", url);
        target.set_src(url);
    }

    fn start(&self, target: Arc<dyn ImageTarget>, url: &str, resolved: Url) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No async runtime available, not compressing {}", url);
                target.set_src(url);
                return;
            }
        };

        if !self.inner.cache.begin(url, target.clone()) {
            // Lost the claim to a concurrent assignment
            self.assign_in_flight(target, url);
            return;
        }

        // Hold the lock across spawn so the task cannot deregister before it is registered
        let mut tasks = self.inner.tasks.lock();
        let inner = self.inner.clone();
        let key = url.to_string();
        let task = runtime.spawn(async move { inner.run(key, resolved).await });
        tasks.insert(url.to_string(), task);
    }
}

impl ImageLoader for ImageCompressionService {
    fn assign(&self, target: Arc<dyn ImageTarget>, url: &str) {
        // One key per URL, however it was padded
        let url = url.trim();
        if !self.is_running() {
            target.set_src(url);
            return;
        }

        let resolved = match self.inner.filter.check(url) {
            Eligibility::Eligible(resolved) => resolved,
            Eligibility::PassThrough(reason) => {
                log::debug!("Not compressing {} ({})", url, reason);
                target.set_src(url);
                return;
            }
        };

        match self.inner.cache.lookup(url) {
            Lookup::Cached(src) => {
                log::debug!("Using cached source for {}", url);
                target.set_src(&src);
            }
            Lookup::InFlight => self.assign_in_flight(target, url),
            Lookup::Vacant => self.start(target, url, resolved),
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, url: String, resolved: Url) {
        let (src, source) = match self.compress(&resolved).await {
            Ok(Outcome::Skipped { width, height }) => {
                log::debug!("Skipping {} ({}x{} is below the minimum size)", url, width, height);
                (url.clone(), Some(CachedSource::Skipped { url: url.clone() }))
            }
            Ok(Outcome::Compressed { image, original_size }) => {
                let compressed_size = image.data.len() as u64;
                let handle = self.blobs.create_object_url(image.data, &image.content_type);
                if self.config.debug {
                    log::info!(
                        "Compressed {}: {} -> {} bytes ({:.1}% reduction, {}x{})",
                        url,
                        original_size,
                        compressed_size,
                        reduction_percent(original_size, compressed_size),
                        image.width,
                        image.height
                    );
                }
                (
                    handle.clone(),
                    Some(CachedSource::Compressed {
                        handle,
                        original_size,
                        compressed_size,
                    }),
                )
            }
            Err(e) => {
                if self.config.debug {
                    log::warn!("Compression failed for {}, using the original: {}", url, e);
                } else {
                    log::debug!("Compression failed for {}: {}", url, e);
                }
                (url.clone(), None)
            }
        };

        // Deregister before leaving the in-flight set, a follow-up pipeline may register right after
        self.tasks.lock().remove(&url);
        let finished = self.cache.finish(&url, source);
        if let Some(rejected) = finished.rejected {
            // Stopped while we were working; targets were already given the original
            self.release(&rejected);
            return;
        }
        for target in finished.targets {
            target.set_src(&src);
        }
    }

    async fn compress(&self, resolved: &Url) -> Result<Outcome, ImageError> {
        let fetched = self.fetcher.fetch(resolved).await?;
        let original_size = fetched.data.len() as u64;

        let codec = self.codec.clone();
        let settings = self.settings;
        let (min_width, min_height) = (self.config.min_width, self.config.min_height);

        tokio::task::spawn_blocking(move || -> Result<Outcome, ImageError> {
            let img = codec.decode(&fetched.data)?;
            let (width, height) = img.dimensions();
            if width < min_width && height < min_height {
                return Ok(Outcome::Skipped { width, height });
            }
            let image = codec.compress(&img, &settings)?;
            Ok(Outcome::Compressed { image, original_size })
        })
        .await
        .map_err(|e| ImageError::TaskError(e.to_string()))?
    }

    /// Revokes the handle behind `source`, if it owns one.
    fn release(&self, source: &CachedSource) -> bool {
        match source {
            CachedSource::Compressed { handle, .. } if is_object_url(handle) => {
                self.blobs.revoke_object_url(handle);
                true
            }
            _ => false,
        }
    }
}
