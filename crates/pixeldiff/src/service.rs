//! Construction of the diff store and its collaborators from the configuration.

use std::sync::Arc;

use anyhow::{Context, Result};

use pixeldiff_service::caching::{CacheContents, CacheError};
use pixeldiff_service::config::Config;
use pixeldiff_service::diffstore::{self, DiffStore};
use pixeldiff_service::loader::{HttpImageLoader, ImageLoaderConfig};
use pixeldiff_service::mapper::{DiffMapper, PixelDiffMapper};
use pixeldiff_service::store::FsMetricStore;

/// The underlying service for the HTTP request handlers.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: Config,
    mapper: Arc<PixelDiffMapper>,
    store: DiffStore<PixelDiffMapper>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("bind", &self.inner.config.bind)
            .finish()
    }
}

impl Service {
    /// Creates the full service stack from the configuration.
    ///
    /// Must be called within a tokio runtime.
    pub fn create(config: Config) -> Result<Self> {
        let mapper = Arc::new(PixelDiffMapper::new(&config.remote_image_dir));
        let concurrency = config.effective_concurrency();
        let (image_count, metric_count) = diffstore::cache_counts(config.budget_gigs);
        tracing::info!(
            image_count,
            metric_count,
            "sizing in-memory caches for {} gigabytes",
            config.budget_gigs
        );

        let loader = HttpImageLoader::new(
            Arc::clone(&mapper),
            &config.base_dir,
            ImageLoaderConfig {
                image_dir: DiffStore::<PixelDiffMapper>::image_dir(&config.base_dir),
                base_url: config.image_base_url.clone(),
                buckets: config.buckets.clone(),
                cache_count: image_count,
                concurrency,
                download_timeout: config.download_timeout,
                connect_timeout: config.connect_timeout,
            },
        )
        .context("failed to create the image loader")?;

        let metric_store = FsMetricStore::new(Arc::clone(&mapper), &config.base_dir)
            .context("failed to create the metric store")?;

        let store = DiffStore::new(
            Arc::clone(&mapper),
            Arc::new(loader),
            Arc::new(metric_store),
            &config.base_dir,
            metric_count,
            concurrency,
        )
        .context("failed to create the diff store")?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                mapper,
                store,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The PNG bytes of a source image, fetched from remote storage if needed.
    pub async fn image_png(&self, digest: &str) -> CacheContents<Vec<u8>> {
        self.inner.store.image_bytes(digest).await
    }

    /// The PNG bytes of a previously computed diff image.
    pub async fn diff_png(&self, id: &str) -> CacheContents<Vec<u8>> {
        // Only the canonical id form is served, mirrors of it are rejected.
        if !self.inner.mapper.is_valid_diff_id(id) {
            return Err(CacheError::InvalidId(id.to_owned()));
        }
        let (left, right) = self.inner.mapper.split_diff_id(id)?;
        self.inner.store.diff_bytes(&left, &right).await
    }

    /// The diff store behind this service.
    pub fn store(&self) -> &DiffStore<PixelDiffMapper> {
        &self.inner.store
    }
}
