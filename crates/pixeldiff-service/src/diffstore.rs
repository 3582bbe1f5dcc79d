//! The diff store: computes, caches and serves image diffs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::FutureExt;

use crate::caching::{
    CacheContents, CacheError, PRIORITY_NOW, Priority, ReadThroughCache, WorkerFn,
};
use crate::loader::{DigestFailure, ImageLoader};
use crate::mapper::{DiffMapper, encode_png};
use crate::store::MetricStore;
use crate::utils::fs::persist_bytes;
use crate::utils::tasks::TaskGroup;

/// Directory under the base dir where source images are stored.
pub const IMG_DIR_NAME: &str = "images";

/// Directory under the base dir where computed diff images are stored.
pub const DIFF_DIR_NAME: &str = "diffs";

/// Assumed in-memory size of one decoded image.
const BYTES_PER_IMAGE: u64 = 1024 * 1024;

/// Assumed in-memory size of one diff metric.
const BYTES_PER_DIFF_METRIC: u64 = 100;

/// Splits a memory budget in gigabytes into the entry counts for the image
/// cache and the diff metric cache.
///
/// With `n` images resident, up to `n * n` pairwise diff metrics exist, so
/// `n` solves `n * imgSize + n^2 * metricSize = budget`. A budget of zero or
/// below disables both caches.
pub fn cache_counts(gigs: f64) -> (usize, usize) {
    if gigs <= 0.0 {
        return (0, 0);
    }
    let img_size = BYTES_PER_IMAGE as f64;
    let metric_size = BYTES_PER_DIFF_METRIC as f64;
    let budget = gigs * (1024u64 * 1024 * 1024) as f64;

    let img_count =
        ((-img_size + (img_size * img_size + 4.0 * metric_size * budget).sqrt())
            / (2.0 * metric_size)) as usize;
    (img_count, img_count * img_count)
}

/// Shared state of the diff computation worker.
struct DiffContext<M: DiffMapper> {
    mapper: Arc<M>,
    loader: Arc<dyn ImageLoader>,
    metric_store: Arc<dyn MetricStore<M::Metric>>,
    diff_dir: PathBuf,
    /// Tracks the background writes of diff images and metrics.
    saves: TaskGroup,
}

impl<M: DiffMapper> DiffContext<M> {
    /// Computes the metric for one diff id: loads a persisted metric if there
    /// is one, otherwise fetches both images, diffs them, and schedules the
    /// diff image and metric for persistence.
    async fn compute(self: &Arc<Self>, priority: Priority, id: String) -> CacheContents<M::Metric> {
        let (left, right) = self.mapper.split_diff_id(&id)?;

        match self.metric_store.load(&id).await {
            Ok(Some(metric)) => {
                metric!(counter("diffstore.metric.persisted") += 1);
                return Ok(metric);
            }
            Ok(None) => {}
            // A broken store record is recomputed, not fatal.
            Err(err) => tracing::error!(id, "failed to load persisted metric: {err:#}"),
        }

        let (images, _pending) = self
            .loader
            .get(priority, &[left.clone(), right.clone()])
            .await?;
        let (metric, diff_image) = self.mapper.diff(&images[0], &images[1]);

        metric!(counter("diffstore.metric.computed") += 1);
        self.save_diff(&id, &left, &right, &metric, diff_image);
        Ok(metric)
    }

    /// Persists the diff image and metric in the background, tracked on the
    /// `saves` group.
    fn save_diff(
        self: &Arc<Self>,
        id: &str,
        left: &str,
        right: &str,
        metric: &M::Metric,
        diff_image: image::RgbaImage,
    ) {
        let this = Arc::clone(self);
        let id = id.to_owned();
        let path = self.diff_dir.join(self.mapper.diff_path(left, right));
        let metric = metric.clone();

        self.saves.spawn(async move {
            match encode_png(&diff_image) {
                Ok(bytes) => {
                    let write_path = path.clone();
                    let result =
                        tokio::task::spawn_blocking(move || persist_bytes(&write_path, &bytes))
                            .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::error!(
                            id,
                            error = &err as &dyn std::error::Error,
                            "failed to write diff image",
                        ),
                        Err(err) => tracing::error!(id, "diff image write task failed: {err}"),
                    }
                }
                Err(err) => tracing::error!(id, error = %err, "failed to encode diff image"),
            }

            if let Err(err) = this.metric_store.save(&id, &metric).await {
                tracing::error!(id, "failed to persist diff metric: {err:#}");
            }
        });
    }
}

/// Stores and serves image diffs and their metrics.
///
/// Source images come from an [`ImageLoader`], diff metrics are computed by a
/// mapper on a bounded worker pool and held in an in-memory read-through
/// cache backed by a persistent [`MetricStore`].
pub struct DiffStore<M: DiffMapper> {
    mapper: Arc<M>,
    loader: Arc<dyn ImageLoader>,
    ctx: Arc<DiffContext<M>>,
    cache: Arc<ReadThroughCache<M::Metric>>,
    image_dir: PathBuf,
    diff_dir: PathBuf,
}

impl<M: DiffMapper> DiffStore<M> {
    /// Creates a diff store under `base_dir`, keeping at most
    /// `metric_cache_count` diff metrics in memory and computing diffs on
    /// `concurrency` workers.
    ///
    /// The loader must read and write images in the store's image directory,
    /// [`image_dir`](Self::image_dir) under the same base dir.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        mapper: Arc<M>,
        loader: Arc<dyn ImageLoader>,
        metric_store: Arc<dyn MetricStore<M::Metric>>,
        base_dir: &Path,
        metric_cache_count: usize,
        concurrency: usize,
    ) -> Result<Self> {
        let image_dir = base_dir.join(IMG_DIR_NAME);
        let diff_dir = base_dir.join(DIFF_DIR_NAME);
        for dir in [&image_dir, &diff_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let ctx = Arc::new(DiffContext {
            mapper: Arc::clone(&mapper),
            loader: Arc::clone(&loader),
            metric_store,
            diff_dir: diff_dir.clone(),
            saves: TaskGroup::default(),
        });

        let worker_fn: WorkerFn<M::Metric> = {
            let ctx = Arc::clone(&ctx);
            Arc::new(move |priority, id| {
                let ctx = Arc::clone(&ctx);
                async move { ctx.compute(priority, id).await }.boxed()
            })
        };
        let cache = Arc::new(ReadThroughCache::new(
            worker_fn,
            metric_cache_count,
            concurrency,
        ));

        Ok(Self {
            mapper,
            loader,
            ctx,
            cache,
            image_dir,
            diff_dir,
        })
    }

    /// The directory the loader must store images in.
    pub fn image_dir(base_dir: &Path) -> PathBuf {
        base_dir.join(IMG_DIR_NAME)
    }

    /// Returns the diff metrics between `main_digest` and each of the
    /// `right_digests`, keyed by right digest.
    ///
    /// The main digest itself is skipped if it appears among the right
    /// digests. Digests whose diff fails are logged and left out of the
    /// result; an empty or invalid main digest is an error.
    pub async fn get(
        &self,
        priority: Priority,
        main_digest: &str,
        right_digests: &[String],
    ) -> Result<HashMap<String, M::Metric>> {
        if main_digest.is_empty() {
            anyhow::bail!("received empty main digest");
        }
        if !self.mapper.is_valid_image_id(main_digest) {
            anyhow::bail!("received invalid main digest: {main_digest}");
        }

        let results = Mutex::new(HashMap::new());
        let diffs = right_digests
            .iter()
            .filter(|right| {
                if !self.mapper.is_valid_image_id(right) {
                    tracing::warn!(digest = %right, "skipping invalid digest");
                    return false;
                }
                right.as_str() != main_digest
            })
            .map(|right| {
                let id = self.mapper.diff_id(main_digest, right);
                let results = &results;
                async move {
                    match self.cache.get(priority, &id).await {
                        Ok(metric) => {
                            results.lock().unwrap().insert(right.clone(), metric);
                        }
                        Err(err) => {
                            tracing::warn!(id, error = %err, "failed to compute diff");
                        }
                    }
                }
            });
        futures::future::join_all(diffs).await;

        Ok(results.into_inner().unwrap())
    }

    /// Prefetches the diffs between all pairs of the two digest lists in the
    /// background.
    ///
    /// The returned [`TaskGroup`] completes when every diff has been computed
    /// or failed; failures are logged. Diff image and metric writes may still
    /// be in flight, see [`sync_writes`](Self::sync_writes).
    pub fn warm_diffs(
        &self,
        priority: Priority,
        left_digests: &[String],
        right_digests: &[String],
    ) -> TaskGroup {
        // Diff ids are commutative, so the cross product collapses into a set
        // of unique ids before any work is scheduled.
        let mut ids = HashSet::new();
        for left in left_digests {
            for right in right_digests {
                if left == right
                    || !self.mapper.is_valid_image_id(left)
                    || !self.mapper.is_valid_image_id(right)
                {
                    continue;
                }
                ids.insert(self.mapper.diff_id(left, right));
            }
        }

        let group = TaskGroup::default();
        for id in ids {
            let cache = Arc::clone(&self.cache);
            group.spawn(async move {
                if let Err(err) = cache.warm(priority, &id).await {
                    tracing::warn!(id, error = %err, "failed to warm diff");
                }
            });
        }
        group
    }

    /// Prefetches the given source images. If `sync` is set, this waits until
    /// the images are on disk.
    pub async fn warm_images(&self, priority: Priority, digests: &[String], sync: bool) {
        let missing: Vec<String> = digests
            .iter()
            .filter(|digest| {
                if !self.mapper.is_valid_image_id(digest) {
                    tracing::warn!(digest = %digest, "skipping invalid digest");
                    return false;
                }
                !self.loader.is_on_disk(digest)
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }
        self.loader.warm(priority, &missing, sync).await;
    }

    /// The digests that currently cannot be retrieved, with the recorded
    /// failure reason.
    pub fn unavailable_digests(&self) -> BTreeMap<String, DigestFailure> {
        self.loader.unavailable_digests()
    }

    /// Removes all traces of the given digests: their images, all diffs and
    /// metrics involving them, and their failure records.
    ///
    /// With `purge_remote` set, the images are also deleted from remote
    /// storage. Failure records are purged last so that an error in an
    /// earlier stage keeps the digest marked as problematic.
    pub async fn purge_digests(&self, digests: &[String], purge_remote: bool) -> Result<()> {
        for digest in digests {
            if !self.mapper.is_valid_image_id(digest) {
                anyhow::bail!("received invalid digest: {digest}");
            }
        }

        self.loader.purge_images(digests, purge_remote).await?;

        let affected: Vec<String> = self
            .cache
            .keys()
            .into_iter()
            .filter(|id| match self.mapper.split_diff_id(id) {
                Ok((left, right)) => digests.contains(&left) || digests.contains(&right),
                Err(_) => false,
            })
            .collect();
        self.cache.remove(&affected);

        self.ctx.metric_store.purge(digests).await?;
        self.loader.purge_failures(digests)
    }

    /// Returns the PNG bytes of a source image, fetching it from remote
    /// storage if it is not on local disk yet.
    pub async fn image_bytes(&self, digest: &str) -> CacheContents<Vec<u8>> {
        if !self.mapper.is_valid_image_id(digest) {
            return Err(CacheError::InvalidId(digest.to_owned()));
        }

        if !self.loader.is_on_disk(digest) {
            let (_images, pending) = self
                .loader
                .get(Priority::new(PRIORITY_NOW), &[digest.to_owned()])
                .await?;
            pending.wait().await;
        }

        let (local, _, _) = self.mapper.image_paths(digest);
        Ok(tokio::fs::read(self.image_dir.join(local)).await?)
    }

    /// Returns the PNG bytes of the diff image between two digests, if that
    /// diff has been computed before.
    pub async fn diff_bytes(&self, left: &str, right: &str) -> CacheContents<Vec<u8>> {
        for digest in [left, right] {
            if !self.mapper.is_valid_image_id(digest) {
                return Err(CacheError::InvalidId(digest.to_owned()));
            }
        }

        let path = self.diff_dir.join(self.mapper.diff_path(left, right));
        Ok(tokio::fs::read(path).await?)
    }

    /// Waits until all currently scheduled diff image and metric writes have
    /// finished.
    pub async fn sync_writes(&self) {
        self.ctx.saves.wait().await;
    }
}
