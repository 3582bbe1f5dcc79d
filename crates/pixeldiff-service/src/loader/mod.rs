//! Fetching and caching of reference images.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use url::Url;

use crate::caching::{CacheContents, CacheError, Priority, ReadThroughCache, WorkerFn};
use crate::mapper::{DiffMapper, Image, decode_png};
use crate::utils::fs::persist_bytes;

mod failures;

pub use failures::{DigestFailure, FailureStore};

type SharedWrite = Shared<BoxFuture<'static, ()>>;

/// A join point for the background disk writes of freshly fetched images.
///
/// Callers that need the bytes *on disk* (serving them over HTTP, syncing a
/// warm-up) await it; callers that only need the decoded images in memory
/// drop it.
#[derive(Debug, Default)]
pub struct PendingWrites {
    writes: Vec<SharedWrite>,
}

impl PendingWrites {
    /// Waits until all tracked writes have landed on disk.
    pub async fn wait(self) {
        futures::future::join_all(self.writes).await;
    }
}

/// Fetches and caches source images by digest.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    /// Whether the image for this digest is present on local disk.
    fn is_on_disk(&self, digest: &str) -> bool;

    /// Returns the images for the given digests, fetching them from remote
    /// storage if necessary. Fails if any digest is unavailable.
    ///
    /// The returned [`PendingWrites`] joins the disk writes of any image that
    /// had to be fetched; the images themselves are usable right away.
    async fn get(
        &self,
        priority: Priority,
        digests: &[String],
    ) -> CacheContents<(Vec<Image>, PendingWrites)>;

    /// Prefetches images for the given digests. Per-digest failures are
    /// logged, not returned. If `sync` is set, this waits until the fetched
    /// images are written to disk, otherwise it returns immediately.
    async fn warm(&self, priority: Priority, digests: &[String], sync: bool);

    /// Removes the images for the given digests from the in-memory cache and
    /// from local disk, and from remote storage if `purge_remote` is set.
    /// Missing images are not an error.
    async fn purge_images(&self, digests: &[String], purge_remote: bool) -> Result<()>;

    /// The digests that currently cannot be served, with the recorded reason.
    fn unavailable_digests(&self) -> BTreeMap<String, DigestFailure>;

    /// Drops the failure records for the given digests.
    fn purge_failures(&self, digests: &[String]) -> Result<()>;
}

/// Everything the fetch worker needs; shared between the loader and the
/// worker closures running on the image cache's pool.
struct FetchContext<M> {
    mapper: Arc<M>,
    image_dir: PathBuf,
    client: reqwest::Client,
    base_url: Url,
    buckets: Vec<String>,
    failures: FailureStore,
    /// In-progress disk writes by digest, so concurrent callers can await
    /// the same write.
    pending: Mutex<FxHashMap<String, SharedWrite>>,
}

impl<M: DiffMapper> FetchContext<M> {
    /// Loads one image from disk, or fetches it from a remote bucket and
    /// schedules its disk write. Failures are recorded in the failure store.
    async fn load_image(self: &Arc<Self>, digest: String) -> CacheContents<Image> {
        let (local, bucket, key) = self.mapper.image_paths(&digest);
        let path = self.image_dir.join(&local);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                return match decode_png(&bytes) {
                    Ok(image) => Ok(Arc::new(image)),
                    Err(err) => {
                        self.failures.record(&digest, &err.to_string());
                        Err(err)
                    }
                };
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        metric!(counter("loader.fetch") += 1);
        let bytes = match self.fetch_remote(&bucket, &key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                metric!(counter("loader.fetch.failure") += 1);
                self.failures.record(&digest, &err.to_string());
                return Err(err);
            }
        };

        let image = match decode_png(&bytes) {
            Ok(image) => Arc::new(image),
            Err(err) => {
                self.failures.record(&digest, &err.to_string());
                return Err(err);
            }
        };

        self.spawn_disk_write(digest, path, bytes);
        Ok(image)
    }

    /// Fetches the image bytes, trying the mapper-designated bucket or all
    /// configured ones.
    async fn fetch_remote(&self, bucket: &str, key: &str) -> CacheContents<Vec<u8>> {
        let buckets: Vec<&str> = if bucket.is_empty() {
            self.buckets.iter().map(String::as_str).collect()
        } else {
            vec![bucket]
        };

        let mut last_err = CacheError::NotFound;
        for bucket in buckets {
            let url = self.bucket_url(bucket, key)?;
            tracing::debug!("fetching image from {url}");
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|err| CacheError::DownloadError(err.to_string()))?;
                    return Ok(bytes.to_vec());
                }
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {}
                Ok(response) => {
                    last_err = CacheError::DownloadError(format!(
                        "{bucket}: status {}",
                        response.status()
                    ));
                }
                Err(err) => {
                    last_err = CacheError::DownloadError(format!("{bucket}: {err}"));
                }
            }
        }
        Err(last_err)
    }

    fn bucket_url(&self, bucket: &str, key: &str) -> CacheContents<Url> {
        self.base_url
            .join(&format!("{bucket}/{key}"))
            .map_err(|err| CacheError::DownloadError(err.to_string()))
    }

    /// Writes fetched image bytes to disk in the background, tracked by
    /// digest so interested callers can await the write.
    fn spawn_disk_write(self: &Arc<Self>, digest: String, path: PathBuf, bytes: Vec<u8>) {
        let write: SharedWrite = {
            let digest = digest.clone();
            async move {
                let result =
                    tokio::task::spawn_blocking(move || persist_bytes(&path, &bytes)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            digest,
                            error = &err as &dyn std::error::Error,
                            "failed to write image to disk",
                        );
                    }
                    Err(err) => tracing::error!(digest, "image write task failed: {err}"),
                }
            }
            .boxed()
            .shared()
        };

        self.pending
            .lock()
            .unwrap()
            .insert(digest.clone(), write.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            write.await;
            this.pending.lock().unwrap().remove(&digest);
        });
    }

    /// The pending disk writes for the given digests.
    fn pending_writes(&self, digests: &[String]) -> PendingWrites {
        let pending = self.pending.lock().unwrap();
        PendingWrites {
            writes: digests
                .iter()
                .filter_map(|digest| pending.get(digest).cloned())
                .collect(),
        }
    }
}

struct LoaderInner<M> {
    ctx: Arc<FetchContext<M>>,
    cache: ReadThroughCache<Image>,
}

/// An [`ImageLoader`] that reads images from the local image directory and
/// falls back to fetching them from an HTTP-accessible bucket.
///
/// Decoded images are held in an in-memory read-through cache, so concurrent
/// requests for the same digest share one fetch.
pub struct HttpImageLoader<M> {
    inner: Arc<LoaderInner<M>>,
}

/// Configuration for a [`HttpImageLoader`].
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Local directory the images are stored in.
    pub image_dir: PathBuf,
    /// Base URL of the remote storage endpoint.
    pub base_url: Url,
    /// Buckets to try, in order, when the mapper does not name one.
    pub buckets: Vec<String>,
    /// Capacity of the in-memory image cache.
    pub cache_count: usize,
    /// Number of concurrent image fetches.
    pub concurrency: usize,
    /// Timeout for a single remote fetch.
    pub download_timeout: Duration,
    /// Timeout for establishing a remote connection.
    pub connect_timeout: Duration,
}

impl<M: DiffMapper> HttpImageLoader<M> {
    /// Must be called within a tokio runtime.
    pub fn new(mapper: Arc<M>, base_dir: &Path, config: ImageLoaderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.image_dir)
            .with_context(|| format!("failed to create {}", config.image_dir.display()))?;
        let failures = FailureStore::load(base_dir)?;

        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to create http client")?;

        let ctx = Arc::new(FetchContext {
            mapper,
            image_dir: config.image_dir,
            client,
            base_url: config.base_url,
            buckets: config.buckets,
            failures,
            pending: Mutex::new(FxHashMap::default()),
        });

        let worker_fn: WorkerFn<Image> = {
            let ctx = Arc::clone(&ctx);
            Arc::new(move |_priority, digest| {
                let ctx = Arc::clone(&ctx);
                async move { ctx.load_image(digest).await }.boxed()
            })
        };
        let cache = ReadThroughCache::new(worker_fn, config.cache_count, config.concurrency);

        Ok(Self {
            inner: Arc::new(LoaderInner { ctx, cache }),
        })
    }
}

#[async_trait]
impl<M: DiffMapper> ImageLoader for HttpImageLoader<M> {
    fn is_on_disk(&self, digest: &str) -> bool {
        let (local, _, _) = self.inner.ctx.mapper.image_paths(digest);
        self.inner.ctx.image_dir.join(local).is_file()
    }

    async fn get(
        &self,
        priority: Priority,
        digests: &[String],
    ) -> CacheContents<(Vec<Image>, PendingWrites)> {
        let fetches = digests
            .iter()
            .map(|digest| self.inner.cache.get(priority, digest));
        let images = futures::future::try_join_all(fetches).await?;
        Ok((images, self.inner.ctx.pending_writes(digests)))
    }

    async fn warm(&self, priority: Priority, digests: &[String], sync: bool) {
        let inner = Arc::clone(&self.inner);
        let digests = digests.to_vec();
        let task = async move {
            let fetches = digests.iter().map(|digest| {
                let cache = &inner.cache;
                async move {
                    if let Err(err) = cache.warm(priority, digest).await {
                        tracing::error!(digest, error = %err, "failed to warm image");
                    }
                }
            });
            futures::future::join_all(fetches).await;
            inner.ctx.pending_writes(&digests).wait().await;
        };

        if sync {
            task.await;
        } else {
            tokio::spawn(task);
        }
    }

    async fn purge_images(&self, digests: &[String], purge_remote: bool) -> Result<()> {
        self.inner.cache.remove(digests);

        for digest in digests {
            let (local, bucket, key) = self.inner.ctx.mapper.image_paths(digest);
            match std::fs::remove_file(self.inner.ctx.image_dir.join(local)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to purge image {digest}"));
                }
            }

            if purge_remote {
                self.purge_remote_image(digest, &bucket, &key).await?;
            }
        }
        Ok(())
    }

    fn unavailable_digests(&self) -> BTreeMap<String, DigestFailure> {
        self.inner.ctx.failures.unavailable_digests()
    }

    fn purge_failures(&self, digests: &[String]) -> Result<()> {
        self.inner.ctx.failures.purge(digests)
    }
}

impl<M: DiffMapper> HttpImageLoader<M> {
    async fn purge_remote_image(&self, digest: &str, bucket: &str, key: &str) -> Result<()> {
        let ctx = &self.inner.ctx;
        let buckets: Vec<&str> = if bucket.is_empty() {
            ctx.buckets.iter().map(String::as_str).collect()
        } else {
            vec![bucket]
        };

        for bucket in buckets {
            let url = ctx.bucket_url(bucket, key)?;
            let response = ctx
                .client
                .delete(url)
                .send()
                .await
                .with_context(|| format!("failed to purge remote image {digest}"))?;
            // An image absent from a bucket is already purged.
            if !response.status().is_success()
                && response.status() != reqwest::StatusCode::NOT_FOUND
            {
                anyhow::bail!(
                    "failed to purge remote image {digest} from {bucket}: status {}",
                    response.status()
                );
            }
        }
        Ok(())
    }
}
