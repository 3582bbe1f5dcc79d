use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::fs::persist_bytes;
use crate::utils::tasks::TaskGroup;

/// Durable record of a digest whose image could not be fetched or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestFailure {
    pub digest: String,
    pub reason: String,
    pub time: DateTime<Utc>,
}

/// Keeps [`DigestFailure`] records, mirrored to a JSON file in the base dir
/// so failures remain diagnosable across restarts.
///
/// During a purge these records are deliberately removed *last*: if an
/// earlier purge stage fails, the evidence of what originally went wrong is
/// still there.
#[derive(Debug)]
pub struct FailureStore {
    path: PathBuf,
    records: Arc<Mutex<BTreeMap<String, DigestFailure>>>,
    /// Serializes file writes so an older snapshot never lands after a
    /// newer one.
    write_lock: Arc<Mutex<()>>,
    writes: TaskGroup,
}

impl FailureStore {
    const FILE_NAME: &'static str = "failures.json";

    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(Self::FILE_NAME);
        let records = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            records: Arc::new(Mutex::new(records)),
            write_lock: Arc::default(),
            writes: TaskGroup::default(),
        })
    }

    /// Records a failure for a digest, replacing any previous record.
    ///
    /// The file write happens on a blocking task off the fetch path;
    /// persistence errors are logged, recording never fails the caller.
    pub fn record(&self, digest: &str, reason: &str) {
        self.records.lock().unwrap().insert(
            digest.to_owned(),
            DigestFailure {
                digest: digest.to_owned(),
                reason: reason.to_owned(),
                time: Utc::now(),
            },
        );

        let records = Arc::clone(&self.records);
        let write_lock = Arc::clone(&self.write_lock);
        let path = self.path.clone();
        self.writes.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let _guard = write_lock.lock().unwrap();
                let snapshot = records.lock().unwrap().clone();
                persist(&path, &snapshot)
            })
            .await;
            match result {
                Ok(Err(err)) => tracing::error!("failed to persist digest failures: {err:#}"),
                Err(err) => tracing::error!("digest failure write task failed: {err}"),
                Ok(Ok(())) => {}
            }
        });
    }

    /// Waits until all scheduled failure record writes have finished.
    pub async fn sync_writes(&self) {
        self.writes.wait().await;
    }

    /// All digests that currently have a failure record.
    pub fn unavailable_digests(&self) -> BTreeMap<String, DigestFailure> {
        self.records.lock().unwrap().clone()
    }

    /// Removes the failure records for the given digests. Digests without a
    /// record are ignored.
    pub fn purge(&self, digests: &[String]) -> Result<()> {
        let snapshot = {
            let mut records = self.records.lock().unwrap();
            let mut changed = false;
            for digest in digests {
                changed |= records.remove(digest).is_some();
            }
            changed.then(|| records.clone())
        };

        if let Some(snapshot) = snapshot {
            let _guard = self.write_lock.lock().unwrap();
            persist(&self.path, &snapshot).context("failed to persist digest failures")?;
        }
        Ok(())
    }
}

fn persist(path: &Path, records: &BTreeMap<String, DigestFailure>) -> Result<()> {
    let data = serde_json::to_vec_pretty(records)?;
    persist_bytes(path, &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_purge() {
        let dir = pixeldiff_test::tempdir();

        let store = FailureStore::load(dir.path()).unwrap();
        assert!(store.unavailable_digests().is_empty());

        store.record("aaaa", "download failed: 404");
        store.record("bbbb", "malformed: bad png");
        store.sync_writes().await;

        // A new store picks the records up from disk.
        let store = FailureStore::load(dir.path()).unwrap();
        let unavailable = store.unavailable_digests();
        assert_eq!(unavailable.len(), 2);
        assert_eq!(unavailable["aaaa"].reason, "download failed: 404");

        store.purge(&["aaaa".to_owned(), "unknown".to_owned()]).unwrap();
        let unavailable = store.unavailable_digests();
        assert_eq!(unavailable.len(), 1);
        assert!(unavailable.contains_key("bbbb"));
    }
}
