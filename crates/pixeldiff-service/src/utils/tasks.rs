use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Default)]
struct GroupInner {
    running: Mutex<usize>,
    done: Notify,
}

/// Guard that marks one task as finished when dropped, so panicking tasks
/// still release their waiters.
struct Running(Arc<GroupInner>);

impl Drop for Running {
    fn drop(&mut self) {
        let mut running = self.0.running.lock().unwrap();
        *running -= 1;
        if *running == 0 {
            self.0.done.notify_waiters();
        }
    }
}

/// A cloneable group of spawned tasks that can be awaited together.
///
/// Operations that schedule background work return or expose a `TaskGroup` so
/// that callers which need completion (tests, synchronous warming) can await
/// it explicitly, while everyone else just drops it.
#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.inner.running.lock().unwrap();
        f.debug_struct("TaskGroup").field("running", &running).finish()
    }
}

impl TaskGroup {
    /// Spawns a task tracked by this group.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        *self.inner.running.lock().unwrap() += 1;
        let running = Running(Arc::clone(&self.inner));
        tokio::spawn(async move {
            let _running = running;
            future.await;
        });
    }

    /// Waits until every task spawned on this group so far has finished.
    pub async fn wait(&self) {
        loop {
            let done = self.inner.done.notified();
            if *self.inner.running.lock().unwrap() == 0 {
                return;
            }
            done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_for_all() {
        let group = TaskGroup::default();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let finished = Arc::clone(&finished);
            group.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        group.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 8);

        // Waiting on an empty group returns immediately.
        group.wait().await;
    }
}
