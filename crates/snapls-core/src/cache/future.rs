//! A concurrency-safe keyed memoizer for in-flight computations.
//!
//! The first caller for a key becomes the producer; later callers
//! subscribe and await. A computation keeps running to completion even if
//! individual awaiters cancel; only when the last awaiter leaves is the
//! producer's token cancelled.

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use snapls_std::error::prelude::*;
use snapls_std::hash::{FxHashMap, FxHasher};
use snapls_std::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a cache treats completed failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Failures are stored and returned for the life of the cache. Used
    /// for imports, whose failure is naturally fatal to a query.
    Persistent,
    /// A failed or cancelled computation is retired; the next caller
    /// re-computes.
    Ephemeral,
}

enum EntryState<V> {
    Pending,
    Done(Result<V>),
}

struct Entry<V> {
    state: Mutex<EntryState<V>>,
    notify: Notify,
    awaiters: AtomicUsize,
    /// Cancelled when the last awaiter leaves a pending entry.
    cancel: CancellationToken,
}

impl<V> Entry<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::Pending),
            notify: Notify::new(),
            awaiters: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }
}

struct Inner<K, V> {
    flavor: Flavor,
    shards: Box<[Mutex<FxHashMap<K, Arc<Entry<V>>>>]>,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn shard(&self, key: &K) -> &Mutex<FxHashMap<K, Arc<Entry<V>>>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize & (self.shards.len() - 1)]
    }

    /// Removes the entry, provided the map still holds this exact entry.
    fn retire(&self, key: &K, entry: &Arc<Entry<V>>) {
        let mut shard = self.shard(key).lock();
        if let Some(current) = shard.get(key) {
            if Arc::ptr_eq(current, entry) {
                shard.remove(key);
            }
        }
    }
}

/// A keyed memoizer over in-flight and completed computations.
pub struct FutureCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for FutureCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> FutureCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache of the given flavor.
    pub fn new(flavor: Flavor) -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .next_power_of_two()
            * 2;
        let shards = (0..shard_count.min(64))
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self {
            inner: Arc::new(Inner { flavor, shards }),
        }
    }

    /// Returns the memoized value for `key`, computing it at most once per
    /// concurrent wave.
    ///
    /// `compute` receives a token that is cancelled when every awaiter of
    /// the entry has left; a well-behaved computation checks it at its own
    /// suspension points.
    pub async fn get<F, Fut>(&self, ctx: &CancellationToken, key: K, compute: F) -> Result<V>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut compute = Some(compute);

        loop {
            if ctx.is_cancelled() {
                return Err(Error::cancelled());
            }

            let entry = {
                let mut shard = self.inner.shard(&key).lock();
                match shard.get(&key) {
                    Some(entry) => entry.clone(),
                    None => {
                        let Some(compute) = compute.take() else {
                            // The producing path already ran; only reachable
                            // when another caller retired our failed entry
                            // in between, so report the miss.
                            return Err(error_once!("future cache entry lost"));
                        };
                        let entry = Arc::new(Entry::new());
                        shard.insert(key.clone(), entry.clone());
                        self.spawn_producer(key.clone(), entry.clone(), compute);
                        entry
                    }
                }
            };

            match self.await_entry(ctx, &key, &entry, compute.is_some()).await? {
                Some(result) => return result,
                // Retired under us; retry and possibly promote to producer.
                None => continue,
            }
        }
    }

    /// Waits until the entry resolves. `Ok(None)` asks the caller to retry.
    async fn await_entry(
        &self,
        ctx: &CancellationToken,
        key: &K,
        entry: &Arc<Entry<V>>,
        can_retry: bool,
    ) -> Result<Option<Result<V>>> {
        let _guard = AwaiterGuard::subscribe(self, key, entry);

        loop {
            let notified = entry.notify.notified();
            {
                let state = entry.state.lock();
                if let EntryState::Done(result) = &*state {
                    if let Err(err) = result {
                        // An ephemeral entry that died of someone else's
                        // cancellation is retried rather than surfaced.
                        if can_retry
                            && self.inner.flavor == Flavor::Ephemeral
                            && err.is_cancelled()
                            && !ctx.is_cancelled()
                        {
                            drop(state);
                            self.inner.retire(key, entry);
                            return Ok(None);
                        }
                    }
                    return Ok(Some(result.clone()));
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = ctx.cancelled() => return Err(Error::cancelled()),
            }
        }
    }

    fn spawn_producer<F, Fut>(&self, key: K, entry: Arc<Entry<V>>, compute: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let fut = compute(entry.cancel.clone());
        tokio::spawn(async move {
            let result = fut.await;

            let retire = inner.flavor == Flavor::Ephemeral && result.is_err();
            *entry.state.lock() = EntryState::Done(result);
            if retire {
                inner.retire(&key, &entry);
            }
            entry.notify.notify_waiters();
        });
    }
}

struct AwaiterGuard<'a, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: &'a FutureCache<K, V>,
    key: &'a K,
    entry: &'a Arc<Entry<V>>,
}

impl<'a, K, V> AwaiterGuard<'a, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe(cache: &'a FutureCache<K, V>, key: &'a K, entry: &'a Arc<Entry<V>>) -> Self {
        entry.awaiters.fetch_add(1, Ordering::SeqCst);
        Self { cache, key, entry }
    }
}

impl<K, V> Drop for AwaiterGuard<'_, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.entry.awaiters.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let state = self.entry.state.lock();
        if matches!(&*state, EntryState::Pending) {
            // Last awaiter left a pending entry: release the computation.
            self.entry.cancel.cancel();
            if self.cache.inner.flavor == Flavor::Ephemeral {
                drop(state);
                self.cache.inner.retire(self.key, self.entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_persistent_computes_once() {
        let cache: FutureCache<u32, u32> = FutureCache::new(Flavor::Persistent);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get(&token(), 7, move |_| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(42)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_stores_failure() {
        let cache: FutureCache<u32, u32> = FutureCache::new(Flavor::Persistent);
        let first = cache
            .get(&token(), 1, |_| async { Err(error_once!("boom")) })
            .await;
        assert!(first.is_err());

        // The failure is permanent; the second compute must not run.
        let second = cache
            .get(&token(), 1, |_| async { Ok(5) })
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_ephemeral_retries_after_failure() {
        let cache: FutureCache<u32, u32> = FutureCache::new(Flavor::Ephemeral);
        let first = cache
            .get(&token(), 1, |_| async { Err(error_once!("boom")) })
            .await;
        assert!(first.is_err());

        let second = cache.get(&token(), 1, |_| async { Ok(5) }).await;
        assert_eq!(second.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_survivor_gets_original_result() {
        let cache: FutureCache<u32, u32> = FutureCache::new(Flavor::Ephemeral);
        let cancelled = token();

        let slow = |cancel: CancellationToken| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => Ok(9),
                _ = cancel.cancelled() => Err(Error::cancelled()),
            }
        };

        let quitter = {
            let cache = cache.clone();
            let ctx = cancelled.clone();
            tokio::spawn(async move { cache.get(&ctx, 1, slow).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let survivor = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&token(), 1, slow).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancelled.cancel();

        let quit = quitter.await.unwrap();
        assert!(quit.unwrap_err().is_cancelled());

        // The survivor observes the original result, not the quitter's
        // cancellation.
        assert_eq!(survivor.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_last_awaiter_cancels_computation() {
        let cache: FutureCache<u32, u32> = FutureCache::new(Flavor::Ephemeral);
        let ctx = token();

        let observed = Arc::new(AtomicUsize::new(0));
        let observed2 = observed.clone();
        let waiter = {
            let cache = cache.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                cache
                    .get(&ctx, 1, move |cancel| async move {
                        cancel.cancelled().await;
                        observed2.fetch_add(1, Ordering::SeqCst);
                        Err(Error::cancelled())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 1, "producer was released");

        // The retired entry is recomputed by the next caller.
        let next = cache.get(&token(), 1, |_| async { Ok(3) }).await;
        assert_eq!(next.unwrap(), 3);
    }
}
