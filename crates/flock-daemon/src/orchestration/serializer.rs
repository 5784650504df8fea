//! Per-key ordered execution of asynchronous writes.
//!
//! Each call to [`WriteSerializer::with_lock`] is spawned as its own task
//! that first waits for the previous operation registered under the same
//! key, whether that one succeeded, failed or panicked. Operations under
//! different keys run concurrently. [`WriteSerializer::flush`] is the
//! shutdown barrier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Last operation registered for a key.
#[derive(Debug)]
struct Tail {
    id: u64,
    done: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteSerializer {
    tails: Arc<Mutex<HashMap<String, Tail>>>,
    next_id: Arc<AtomicU64>,
}

/// Marks an operation done and unregisters it as the tail of its key.
struct Settle {
    tails: Arc<Mutex<HashMap<String, Tail>>>,
    key: String,
    id: u64,
    done: watch::Sender<bool>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        let _ = self.done.send(true);
        let mut tails = lock(&self.tails);
        if tails.get(&self.key).is_some_and(|tail| tail.id == self.id) {
            tails.remove(&self.key);
        }
    }
}

fn lock(tails: &Mutex<HashMap<String, Tail>>) -> MutexGuard<'_, HashMap<String, Tail>> {
    tails.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WriteSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain `op` after the current tail for `key`.
    ///
    /// Ordering is fixed at call time, not when the returned handle is
    /// awaited; dropping the handle detaches the operation without
    /// cancelling it.
    pub fn with_lock<F>(&self, key: &str, op: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = lock(&self.tails)
            .insert(key.to_string(), Tail { id, done: done_rx })
            .map(|tail| tail.done);

        let settle = Settle {
            tails: Arc::clone(&self.tails),
            key: key.to_string(),
            id,
            done: done_tx,
        };
        tokio::spawn(async move {
            // Dropped on return, on panic and on abort alike.
            let _settle = settle;
            if let Some(mut previous) = previous {
                // Err means the previous task died without signalling; proceed.
                let _ = previous.wait_for(|done| *done).await;
            }
            op.await
        })
    }

    /// Wait for every operation chained so far, across all keys.
    pub async fn flush(&self) {
        let pending: Vec<watch::Receiver<bool>> = lock(&self.tails)
            .values()
            .map(|tail| tail.done.clone())
            .collect();
        debug!(keys = pending.len(), "Flushing write serializer");
        for mut done in pending {
            let _ = done.wait_for(|done| *done).await;
        }
    }

    /// Number of keys with an operation still in flight.
    pub fn pending_keys(&self) -> usize {
        lock(&self.tails).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn operations_on_one_key_run_in_call_order() {
        let serializer = WriteSerializer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, delay) in [(1, 40), (2, 0), (3, 10)] {
            let log = Arc::clone(&log);
            handles.push(serializer.with_lock("project-a", async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(serializer.pending_keys(), 0);
    }

    #[tokio::test]
    async fn failure_does_not_break_the_chain() {
        let serializer = WriteSerializer::new();
        let first = serializer.with_lock("k", async { Err::<u32, &str>("disk full") });
        let second = serializer.with_lock("k", async { Ok::<u32, &str>(7) });
        assert!(first.await.unwrap().is_err());
        assert_eq!(second.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn panicking_operation_does_not_block_successor() {
        let serializer = WriteSerializer::new();
        let first = serializer.with_lock("k", async {
            #[allow(clippy::panic)]
            {
                panic!("boom");
            }
        });
        let second = serializer.with_lock("k", async { 42 });
        assert!(first.await.is_err());
        assert_eq!(second.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn panicking_last_operation_releases_its_key() {
        let serializer = WriteSerializer::new();
        let only = serializer.with_lock("k", async {
            #[allow(clippy::panic)]
            {
                panic!("boom");
            }
        });
        assert!(only.await.unwrap_err().is_panic());
        assert_eq!(serializer.pending_keys(), 0);

        tokio::time::timeout(Duration::from_secs(1), serializer.flush())
            .await
            .expect("flush must not wait on a panicked operation");
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let serializer = WriteSerializer::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = serializer.with_lock("a", async move {
            let _ = release_rx.await;
        });
        let free = serializer.with_lock("b", async { "done" });

        let result = tokio::time::timeout(Duration::from_secs(1), free)
            .await
            .expect("key b must not wait for key a")
            .unwrap();
        assert_eq!(result, "done");

        release_tx.send(()).unwrap();
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn flush_waits_for_all_keys() {
        let serializer = WriteSerializer::new();
        let counter = Arc::new(AtomicU64::new(0));
        for key in ["a", "b", "a", "c"] {
            let counter = Arc::clone(&counter);
            // Detached: only flush observes completion.
            drop(serializer.with_lock(key, async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        serializer.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
