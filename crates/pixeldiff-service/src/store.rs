//! Persistence for computed diff metrics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::mapper::DiffMapper;
use crate::utils::fs::persist_bytes;

/// Persistent storage of diff metrics by diff id.
///
/// Persisted metrics survive restarts and let the diff worker skip
/// recomputation of diffs it has already seen.
#[async_trait]
pub trait MetricStore<T: Send + Sync + 'static>: Send + Sync {
    /// Loads the persisted metric for a diff id, `None` if there is none.
    async fn load(&self, id: &str) -> Result<Option<T>>;

    /// Persists the metric for a diff id, replacing any previous one.
    async fn save(&self, id: &str, metric: &T) -> Result<()>;

    /// Removes all persisted metrics whose diff id contains one of the given
    /// digests. Missing records are not an error.
    async fn purge(&self, digests: &[String]) -> Result<()>;
}

/// A [`MetricStore`] keeping one file per diff id, encoded via the mapper's
/// metric codec.
#[derive(Debug)]
pub struct FsMetricStore<M> {
    mapper: Arc<M>,
    dir: PathBuf,
}

impl<M: DiffMapper> FsMetricStore<M> {
    /// Directory under the base dir where the metric files live.
    pub const DIR_NAME: &'static str = "diffmetrics";

    pub fn new(mapper: Arc<M>, base_dir: &Path) -> Result<Self> {
        let dir = base_dir.join(Self::DIR_NAME);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { mapper, dir })
    }

    fn metric_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

#[async_trait]
impl<M: DiffMapper> MetricStore<M::Metric> for FsMetricStore<M> {
    async fn load(&self, id: &str) -> Result<Option<M::Metric>> {
        let data = match tokio::fs::read(self.metric_path(id)).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to read diff metric"),
        };
        let metric = self
            .mapper
            .decode(&data)
            .with_context(|| format!("failed to decode diff metric {id}"))?;
        Ok(Some(metric))
    }

    async fn save(&self, id: &str, metric: &M::Metric) -> Result<()> {
        let data = self.mapper.encode(metric)?;
        let path = self.metric_path(id);
        tokio::task::spawn_blocking(move || persist_bytes(&path, &data))
            .await
            .context("persist task failed")?
            .with_context(|| format!("failed to write diff metric {id}"))?;
        Ok(())
    }

    async fn purge(&self, digests: &[String]) -> Result<()> {
        let digests: HashSet<&str> = digests.iter().map(String::as_str).collect();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("failed to list diff metrics"),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Ok((left, right)) = self.mapper.split_diff_id(&name.to_string_lossy()) else {
                continue;
            };
            if !digests.contains(left.as_str()) && !digests.contains(right.as_str()) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).context("failed to remove diff metric"),
            }
        }
        Ok(())
    }
}
