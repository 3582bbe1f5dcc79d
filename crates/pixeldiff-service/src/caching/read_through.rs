use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;

use super::{CacheContents, CacheError, Priority};

/// The function that computes values entering the cache.
///
/// This is the *only* way new values get into a [`ReadThroughCache`]: a miss
/// queues one invocation of this function, and every concurrent caller for
/// the same id joins that single invocation.
pub type WorkerFn<T> =
    Arc<dyn Fn(Priority, String) -> BoxFuture<'static, CacheContents<T>> + Send + Sync>;

type SharedResult<T> = Shared<BoxFuture<'static, CacheContents<T>>>;

/// One slot in the cache's id map.
enum Slot<T> {
    /// A computation for this id is queued or running. Late callers clone the
    /// shared future and join it instead of starting a duplicate.
    InFlight(SharedResult<T>),
    /// A computed value together with its recency marker.
    Cached { value: T, last_used: u64 },
}

struct State<T> {
    slots: FxHashMap<String, Slot<T>>,
    /// Monotonic use counter backing the LRU order of cached slots.
    use_seq: u64,
}

/// A job waiting for a worker, ordered by [`Priority`].
struct QueuedJob<T> {
    priority: Priority,
    id: String,
    tx: oneshot::Sender<CacheContents<T>>,
}

impl<T> PartialEq for QueuedJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl<T> Eq for QueuedJob<T> {}

impl<T> PartialOrd for QueuedJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedJob<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap, the smallest priority must win.
        other.priority.cmp(&self.priority)
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    queue: Mutex<BinaryHeap<QueuedJob<T>>>,
    /// Counts queued jobs; workers block on it when the queue is empty.
    jobs: Semaphore,
    worker_fn: WorkerFn<T>,
    max_entries: usize,
}

/// A get-or-compute cache keyed by string id.
///
/// Values are computed by a bounded pool of workers that picks queued jobs in
/// [`Priority`] order. Concurrent requests for the same id share a single
/// computation (single-flight), and a failed computation is not cached, so
/// the next request retries it. When more than `max_entries` values are
/// resident, the least recently used ones are evicted on insert.
pub struct ReadThroughCache<T> {
    inner: Arc<Inner<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T> std::fmt::Debug for ReadThroughCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .inner
            .state
            .try_lock()
            .map(|state| state.slots.len())
            .unwrap_or_default();
        f.debug_struct("ReadThroughCache")
            .field("entries", &entries)
            .field("max_entries", &self.inner.max_entries)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> ReadThroughCache<T> {
    /// Creates a cache computing values with `worker_fn` on a pool of
    /// `concurrency` workers, keeping at most `max_entries` values resident.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(worker_fn: WorkerFn<T>, max_entries: usize, concurrency: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                slots: FxHashMap::default(),
                use_seq: 0,
            }),
            queue: Mutex::new(BinaryHeap::new()),
            jobs: Semaphore::new(0),
            worker_fn,
            max_entries,
        });

        let workers = (0..concurrency.max(1))
            .map(|_| {
                let inner = Arc::clone(&inner);
                tokio::spawn(Self::run_worker(inner))
            })
            .collect();

        Self { inner, workers }
    }

    /// Returns the cached value for `id`, computing it if necessary.
    ///
    /// If a computation for `id` is already in flight, this call joins it and
    /// receives the same result as every other joined caller.
    pub async fn get(&self, priority: Priority, id: &str) -> CacheContents<T> {
        let shared = {
            let mut state = self.inner.state.lock().unwrap();
            let State { slots, use_seq } = &mut *state;

            match slots.get_mut(id) {
                Some(Slot::Cached { value, last_used }) => {
                    *use_seq += 1;
                    *last_used = *use_seq;
                    return Ok(value.clone());
                }
                Some(Slot::InFlight(shared)) => shared.clone(),
                None => {
                    let (tx, rx) = oneshot::channel();
                    // The sender is dropped without sending only if the
                    // worker pool goes away underneath us.
                    let shared: SharedResult<T> = rx
                        .map(|res| res.unwrap_or(Err(CacheError::InternalError)))
                        .boxed()
                        .shared();
                    slots.insert(id.to_owned(), Slot::InFlight(shared.clone()));

                    self.inner.queue.lock().unwrap().push(QueuedJob {
                        priority,
                        id: id.to_owned(),
                        tx,
                    });
                    self.inner.jobs.add_permits(1);

                    shared
                }
            }
        };

        shared.await
    }

    /// Same as [`get`](Self::get), intended for background prefetching where
    /// the caller does not need the value itself.
    pub async fn warm(&self, priority: Priority, id: &str) -> CacheContents<()> {
        self.get(priority, id).await.map(|_| ())
    }

    /// The ids of all current entries, cached values and in-flight
    /// computations alike. Removing an in-flight id keeps its value out of
    /// the cache once the computation finishes.
    pub fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock().unwrap();
        state.slots.keys().cloned().collect()
    }

    /// Evicts the given ids. No recomputation is triggered and nobody is
    /// notified; removing an absent id is a no-op.
    ///
    /// If a computation for a removed id is still in flight, its joined
    /// callers get their result, but the value is not inserted afterwards.
    pub fn remove(&self, ids: &[String]) {
        let mut state = self.inner.state.lock().unwrap();
        for id in ids {
            state.slots.remove(id);
        }
    }

    async fn run_worker(inner: Arc<Inner<T>>) {
        loop {
            let Ok(permit) = inner.jobs.acquire().await else {
                return;
            };
            permit.forget();

            let job = inner.queue.lock().unwrap().pop();
            if let Some(job) = job {
                Self::process(&inner, job).await;
            }
        }
    }

    async fn process(inner: &Arc<Inner<T>>, job: QueuedJob<T>) {
        // A panicking computation must not take the worker down with it, the
        // pool never gets refilled.
        let computation = (inner.worker_fn)(job.priority, job.id.clone());
        let result = match AssertUnwindSafe(computation).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(id = %job.id, "computation panicked");
                Err(CacheError::InternalError)
            }
        };

        {
            let mut state = inner.state.lock().unwrap();
            match &result {
                Ok(value) => {
                    state.use_seq += 1;
                    let last_used = state.use_seq;
                    // The slot may have been removed while the computation
                    // ran; in that case the result is handed to the joined
                    // callers but not cached.
                    if let Some(slot) = state.slots.get_mut(&job.id) {
                        *slot = Slot::Cached {
                            value: value.clone(),
                            last_used,
                        };
                    }
                    Self::evict(&mut state, inner.max_entries);
                }
                Err(_) => {
                    state.slots.remove(&job.id);
                }
            }
        }

        // State is updated before joiners observe the result.
        job.tx.send(result).ok();
    }

    /// Drops least-recently-used cached slots until at most `max_entries`
    /// remain. In-flight slots are never touched.
    fn evict(state: &mut State<T>, max_entries: usize) {
        loop {
            let mut resident = 0;
            let mut oldest: Option<(&String, u64)> = None;
            for (id, slot) in state.slots.iter() {
                let Slot::Cached { last_used, .. } = slot else {
                    continue;
                };
                resident += 1;
                if oldest.is_none_or(|(_, prev)| *last_used < prev) {
                    oldest = Some((id, *last_used));
                }
            }

            if resident <= max_entries {
                return;
            }
            match oldest.map(|(id, _)| id.clone()) {
                Some(id) => state.slots.remove(&id),
                None => return,
            };
        }
    }
}

impl<T> Drop for ReadThroughCache<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::super::{PRIORITY_BACKGROUND, PRIORITY_NOW};
    use super::*;

    fn counting_worker(calls: Arc<AtomicUsize>) -> WorkerFn<String> {
        Arc::new(move |_priority, id| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("value-{id}"))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ReadThroughCache::new(counting_worker(Arc::clone(&calls)), 10, 4);

        let results = futures::future::join_all(
            (0..16).map(|_| cache.get(Priority::new(PRIORITY_NOW), "abc")),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "value-abc");
        }
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker: WorkerFn<String> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_priority, id| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(CacheError::DownloadError("boom".into()))
                    } else {
                        Ok(format!("value-{id}"))
                    }
                }
                .boxed()
            })
        };
        let cache = ReadThroughCache::new(worker, 10, 2);

        let err = cache.get(Priority::new(PRIORITY_NOW), "abc").await;
        assert_eq!(err, Err(CacheError::DownloadError("boom".into())));
        assert!(cache.keys().is_empty());

        // The failed computation was not cached, so this one retries.
        let ok = cache.get(Priority::new(PRIORITY_NOW), "abc").await;
        assert_eq!(ok.unwrap(), "value-abc");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_workers_survive_panics() {
        let worker: WorkerFn<String> = Arc::new(|_priority, id| {
            async move {
                if id.starts_with("broken") {
                    panic!("cannot compute {id}");
                }
                Ok(format!("value-{id}"))
            }
            .boxed()
        });
        // A single worker: one unrecovered panic would wedge the pool.
        let cache = ReadThroughCache::new(worker, 10, 1);

        for id in ["broken-1", "broken-2"] {
            let err = cache.get(Priority::new(PRIORITY_NOW), id).await;
            assert_eq!(err, Err(CacheError::InternalError));
        }
        assert!(cache.keys().is_empty());

        let ok = cache.get(Priority::new(PRIORITY_NOW), "abc").await;
        assert_eq!(ok.unwrap(), "value-abc");
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ReadThroughCache::new(counting_worker(calls), 2, 1);

        cache.get(Priority::new(PRIORITY_NOW), "a").await.unwrap();
        cache.get(Priority::new(PRIORITY_NOW), "b").await.unwrap();
        // Touch "a" so that "b" is now the least recently used entry.
        cache.get(Priority::new(PRIORITY_NOW), "a").await.unwrap();
        cache.get(Priority::new(PRIORITY_NOW), "c").await.unwrap();

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "c".to_owned()]);
    }

    #[tokio::test]
    async fn test_remove() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ReadThroughCache::new(counting_worker(Arc::clone(&calls)), 10, 2);

        cache.get(Priority::new(PRIORITY_NOW), "a").await.unwrap();
        cache.get(Priority::new(PRIORITY_NOW), "b").await.unwrap();
        cache.remove(&["a".to_owned(), "missing".to_owned()]);

        assert_eq!(cache.keys(), vec!["b".to_owned()]);

        // "a" needs to be recomputed after removal.
        cache.get(Priority::new(PRIORITY_NOW), "a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remove_in_flight() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker: WorkerFn<String> = {
            let gate = Arc::clone(&gate);
            Arc::new(move |_priority, id| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    Ok(id)
                }
                .boxed()
            })
        };
        let cache = Arc::new(ReadThroughCache::new(worker, 10, 1));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(Priority::new(PRIORITY_NOW), "a").await })
        };
        while cache.keys().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Removal while the computation runs: the joined caller still gets
        // its result, but the value is not inserted afterwards.
        cache.remove(&["a".to_owned()]);
        gate.add_permits(1);
        assert_eq!(pending.await.unwrap().unwrap(), "a");
        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let worker: WorkerFn<String> = {
            let order = Arc::clone(&order);
            let gate = Arc::clone(&gate);
            Arc::new(move |_priority, id| {
                let order = Arc::clone(&order);
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    order.lock().unwrap().push(id.clone());
                    Ok(id)
                }
                .boxed()
            })
        };

        // One worker: the first job occupies it while the others queue up.
        let cache = Arc::new(ReadThroughCache::new(worker, 10, 1));

        let mut pending = Vec::new();
        for (class, id) in [
            (PRIORITY_NOW, "first"),
            (PRIORITY_BACKGROUND, "background-1"),
            (PRIORITY_BACKGROUND, "background-2"),
            (PRIORITY_NOW, "urgent"),
        ] {
            let cache = Arc::clone(&cache);
            let priority = Priority::new(class);
            pending.push(tokio::spawn(async move {
                cache.get(priority, id).await.unwrap()
            }));
            // Make sure the job is queued before submitting the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.add_permits(4);
        for handle in pending {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec!["first", "urgent", "background-1", "background-2"]
        );
    }
}
