//! Fixed-capacity pool of asynchronously built resources.
//!
//! Slots `0..capacity` each hold nothing, an in-flight build, or a ready
//! resource. Builds run on their own task and are shared: every caller that
//! finds a slot building awaits the same future, so a slot is never built
//! twice at once. A failed build leaves the slot empty; evicted slots are
//! rebuilt on the next acquisition.
//!
//! ```text
//! Empty ──get/acquire──► Building(gen) ──ok──► Ready(gen)
//!   ▲                        │                    │
//!   └────────── err ─────────┘◄── delete/evict ───┘
//! ```
//!
//! Every slot transition bumps nothing but the slot; a generation number
//! tags each build so a stale lease can never evict its replacement.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::FLOW_BUS_CAPACITY;
use crate::flows::{PoolFlow, SharedPoolFlowBus, Subscription, shared_pool_flow_bus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("index {index} out of range for pool {pool} (capacity {capacity})")]
    OutOfRange { pool: String, index: usize, capacity: usize },

    #[error("pool {0} has no capacity")]
    NoCapacity(String),

    #[error("pool {0} was dropped")]
    Dropped(String),

    #[error("failed to build {pool}[{index}]: {message}")]
    Build { pool: String, index: usize, message: String },
}

/// What the factory is told about the slot it builds.
pub struct PoolParams<T> {
    pub index: usize,
    pool: WeakPool<T>,
}

impl<T: Clone + Send + Sync + 'static> PoolParams<T> {
    /// The pool being filled, if it is still alive.
    pub fn pool(&self) -> Option<Pool<T>> {
        self.pool.upgrade()
    }

    /// A build error for this slot.
    pub fn fail(&self, error: impl fmt::Display) -> PoolError {
        PoolError::Build { pool: self.pool.name.clone(), index: self.index, message: error.to_string() }
    }
}

/// A ready resource together with the slot it came from.
#[derive(Clone)]
struct Entry<T> {
    index: usize,
    generation: u64,
    value: T,
}

type Factory<T> = Arc<dyn Fn(PoolParams<T>) -> BoxFuture<'static, Result<T, PoolError>> + Send + Sync>;
type Build<T> = Shared<BoxFuture<'static, Result<Entry<T>, PoolError>>>;

enum Slot<T> {
    Empty,
    Building { generation: u64, build: Build<T> },
    Ready { generation: u64, value: T },
}

impl<T> Slot<T> {
    fn generation(&self) -> Option<u64> {
        match self {
            Slot::Empty => None,
            Slot::Building { generation, .. } | Slot::Ready { generation, .. } => Some(*generation),
        }
    }
}

struct PoolInner<T> {
    name: String,
    capacity: usize,
    factory: Factory<T>,
    slots: Mutex<Vec<Slot<T>>>,
    generation: AtomicU64,
    flows: SharedPoolFlowBus,
}

impl<T: Clone + Send + Sync + 'static> PoolInner<T> {
    fn ready_count(slots: &[Slot<T>]) -> usize {
        slots.iter().filter(|s| matches!(s, Slot::Ready { .. })).count()
    }

    fn publish(&self, size: usize) {
        debug!(pool = %self.name, size, capacity = self.capacity, "pool changed");
        self.flows.publish(PoolFlow { pool: self.name.clone(), size, capacity: self.capacity });
    }

    /// Record the outcome of a build, unless the slot moved on meanwhile.
    fn settle(&self, index: usize, generation: u64, result: &Result<Entry<T>, PoolError>) {
        let size = {
            let mut slots = self.slots.lock();
            match &slots[index] {
                Slot::Building { generation: g, .. } if *g == generation => {}
                _ => return,
            }
            slots[index] = match result {
                Ok(entry) => Slot::Ready { generation, value: entry.value.clone() },
                Err(_) => Slot::Empty,
            };
            Self::ready_count(&slots)
        };

        match result {
            Ok(_) => debug!(pool = %self.name, index, "resource ready"),
            Err(e) => warn!(pool = %self.name, index, error = %e, "resource build failed"),
        }
        self.publish(size);
    }
}

/// A pool of `T`, cheap to clone.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// Non-owning handle given to factories.
pub struct WeakPool<T> {
    name: String,
    inner: Weak<PoolInner<T>>,
}

impl<T> WeakPool<T> {
    pub fn upgrade(&self) -> Option<Pool<T>> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}

impl<T: Clone + Send + Sync + 'static> Pool<T> {
    /// Create a pool that builds up to `capacity` resources on demand.
    pub fn new<F, Fut>(name: impl Into<String>, capacity: usize, factory: F) -> Self
    where
        F: Fn(PoolParams<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PoolError>> + Send + 'static,
    {
        let factory: Factory<T> = Arc::new(move |params| factory(params).boxed());
        let slots = (0..capacity).map(|_| Slot::Empty).collect();
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                factory,
                slots: Mutex::new(slots),
                generation: AtomicU64::new(0),
                flows: shared_pool_flow_bus(FLOW_BUS_CAPACITY),
            }),
        }
    }

    /// A pool whose resources are taken out of this one.
    pub fn subpool(&self, name: impl Into<String>, capacity: usize) -> Pool<T> {
        let parent = self.clone();
        Pool::new(name, capacity, move |_params| {
            let parent = parent.clone();
            async move { parent.take_random().await }
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of ready resources.
    pub fn size(&self) -> usize {
        PoolInner::ready_count(&self.inner.slots.lock())
    }

    pub fn downgrade(&self) -> WeakPool<T> {
        WeakPool { name: self.inner.name.clone(), inner: Arc::downgrade(&self.inner) }
    }

    /// Size changes of this pool.
    pub fn subscribe(&self) -> Subscription<PoolFlow> {
        self.inner.flows.subscribe("pool.>")
    }

    fn check(&self, index: usize) -> Result<(), PoolError> {
        if index < self.inner.capacity {
            Ok(())
        } else {
            Err(PoolError::OutOfRange {
                pool: self.inner.name.clone(),
                index,
                capacity: self.inner.capacity,
            })
        }
    }

    /// Start building `index`. The caller holds the slot lock and has
    /// checked that the slot is not already building.
    fn start(&self, slots: &mut [Slot<T>], index: usize) -> Build<T> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let params = PoolParams { index, pool: self.downgrade() };
        let build = (self.inner.factory)(params);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = build.await.map(|value| Entry { index, generation, value });
            inner.settle(index, generation, &result);
            result
        });

        let weak = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let shared: Build<T> = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let error = PoolError::Build { pool: name, index, message: format!("build task failed: {e}") };
                    let result = Err(error.clone());
                    if let Some(inner) = weak.upgrade() {
                        inner.settle(index, generation, &result);
                    }
                    result
                }
            }
        }
        .boxed()
        .shared();

        debug!(pool = %self.inner.name, index, generation, "building resource");
        slots[index] = Slot::Building { generation, build: shared.clone() };
        shared
    }

    async fn entry(&self, index: usize) -> Result<Entry<T>, PoolError> {
        self.check(index)?;
        let build = {
            let mut slots = self.inner.slots.lock();
            match &slots[index] {
                Slot::Ready { generation, value } => {
                    return Ok(Entry { index, generation: *generation, value: value.clone() });
                }
                Slot::Building { build, .. } => build.clone(),
                Slot::Empty => self.start(&mut slots, index),
            }
        };
        build.await
    }

    /// The resource at `index`, building it if the slot is empty.
    ///
    /// Concurrent callers for the same empty slot share one build.
    pub async fn get(&self, index: usize) -> Result<T, PoolError> {
        self.entry(index).await.map(|entry| entry.value)
    }

    /// Lease of a uniformly random ready resource.
    ///
    /// When nothing is ready, every idle slot starts building and the first
    /// successful build wins. If they all fail, the last error is returned.
    pub async fn acquire_random(&self) -> Result<Lease<T>, PoolError> {
        if self.inner.capacity == 0 {
            return Err(PoolError::NoCapacity(self.inner.name.clone()));
        }

        let builds = {
            let mut slots = self.inner.slots.lock();
            let ready: Vec<usize> = (0..slots.len())
                .filter(|&i| matches!(slots[i], Slot::Ready { .. }))
                .collect();

            if !ready.is_empty() {
                let index = ready[rand::thread_rng().gen_range(0..ready.len())];
                if let Slot::Ready { generation, value } = &slots[index] {
                    let entry = Entry { index, generation: *generation, value: value.clone() };
                    return Ok(Lease { pool: self.clone(), entry });
                }
            }

            let mut builds = Vec::with_capacity(slots.len());
            for index in 0..slots.len() {
                let build = match &slots[index] {
                    Slot::Building { build, .. } => build.clone(),
                    _ => self.start(&mut slots, index),
                };
                builds.push(build);
            }
            builds
        };

        let (entry, _) = futures::future::select_ok(builds).await?;
        Ok(Lease { pool: self.clone(), entry })
    }

    /// Remove a random resource from the pool and hand it over.
    ///
    /// The emptied slot is rebuilt on a later acquisition.
    pub async fn take_random(&self) -> Result<T, PoolError> {
        loop {
            let lease = self.acquire_random().await?;
            // Another taker may have won the same slot; try again.
            if lease.evict() {
                return Ok(lease.into_value());
            }
        }
    }

    /// Empty slot `index`, returning its resource if one was ready.
    pub fn delete(&self, index: usize) -> Result<Option<T>, PoolError> {
        self.check(index)?;
        let (old, size) = {
            let mut slots = self.inner.slots.lock();
            let old = std::mem::replace(&mut slots[index], Slot::Empty);
            (old, PoolInner::ready_count(&slots))
        };
        let removed = match old {
            Slot::Ready { value, .. } => Some(value),
            Slot::Building { .. } => None,
            Slot::Empty => return Ok(None),
        };
        debug!(pool = %self.inner.name, index, "resource deleted");
        self.inner.publish(size);
        Ok(removed)
    }

    /// Empty slot `index` only if it still holds build `generation`.
    fn evict(&self, index: usize, generation: u64) -> bool {
        let size = {
            let mut slots = self.inner.slots.lock();
            if slots[index].generation() != Some(generation) {
                return false;
            }
            slots[index] = Slot::Empty;
            PoolInner::ready_count(&slots)
        };
        debug!(pool = %self.inner.name, index, generation, "resource evicted");
        self.inner.publish(size);
        true
    }
}

/// A resource borrowed from a pool.
///
/// Dropping the lease leaves the resource in the pool for others;
/// [`Lease::evict`] takes it out so it is rebuilt.
pub struct Lease<T> {
    pool: Pool<T>,
    entry: Entry<T>,
}

impl<T: Clone + Send + Sync + 'static> Lease<T> {
    pub fn index(&self) -> usize {
        self.entry.index
    }

    pub fn value(&self) -> &T {
        &self.entry.value
    }

    pub fn into_value(self) -> T {
        self.entry.value
    }

    /// Remove this resource from its slot. Returns false if the slot was
    /// already emptied or rebuilt.
    pub fn evict(&self) -> bool {
        self.pool.evict(self.entry.index, self.entry.generation)
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.value
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.inner.name)
            .field("index", &self.entry.index)
            .field("generation", &self.entry.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Pool of `index * 100 + build number`, counting factory calls.
    fn counting_pool(capacity: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pool = Pool::new("test", capacity, move |params: PoolParams<usize>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(params.index * 100 + n)
            }
        });
        (pool, calls)
    }

    #[tokio::test]
    async fn test_concurrent_get_builds_once() {
        let (pool, calls) = counting_pool(3);
        let results = futures::future::join_all((0..10).map(|_| pool.get(1))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &first));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_get_rebuilds_once() {
        let (pool, calls) = counting_pool(2);
        pool.get(0).await.unwrap();
        assert!(pool.delete(0).unwrap().is_some());
        assert_eq!(pool.size(), 0);

        let results = futures::future::join_all((0..4).map(|_| pool.get(0))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let (pool, calls) = counting_pool(3);
        let leases = futures::future::join_all((0..20).map(|_| pool.acquire_random())).await;
        assert!(leases.iter().all(|l| l.is_ok()));
        for _ in 0..20 {
            let lease = pool.acquire_random().await.unwrap();
            assert!(lease.index() < 3);
        }
        assert!(calls.load(Ordering::SeqCst) <= 3);
        assert!(pool.size() <= pool.capacity());
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let (pool, _) = counting_pool(2);
        assert!(matches!(pool.get(2).await, Err(PoolError::OutOfRange { index: 2, .. })));
        assert!(pool.delete(5).is_err());
    }

    #[tokio::test]
    async fn test_failed_build_leaves_slot_empty() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool: Pool<u32> = Pool::new("flaky", 1, move |params: PoolParams<u32>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(params.fail("boom")) } else { Ok(7) } }
        });

        let err = pool.get(0).await.unwrap_err();
        assert!(matches!(err, PoolError::Build { index: 0, .. }));
        assert_eq!(pool.size(), 0);

        assert_eq!(pool.get(0).await.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_when_all_fail_returns_error() {
        let pool: Pool<u32> = Pool::new("dead", 3, |params: PoolParams<u32>| async move { Err(params.fail("down")) });
        assert!(matches!(pool.acquire_random().await, Err(PoolError::Build { .. })));
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity() {
        let (pool, _) = counting_pool(0);
        assert!(matches!(pool.acquire_random().await, Err(PoolError::NoCapacity(_))));
    }

    #[tokio::test]
    async fn test_take_random_removes_resource() {
        let (pool, calls) = counting_pool(1);
        let taken = pool.take_random().await.unwrap();
        assert_eq!(pool.size(), 0);

        let again = pool.take_random().await.unwrap();
        assert_ne!(taken, again);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_evict_replacement() {
        let (pool, _) = counting_pool(1);
        let stale = pool.acquire_random().await.unwrap();
        assert!(stale.evict());

        let fresh = pool.acquire_random().await.unwrap();
        assert!(!stale.evict());
        assert_eq!(pool.size(), 1);
        assert_ne!(*fresh, *stale);
    }

    #[tokio::test]
    async fn test_subpool_draws_from_parent() {
        let (parent, parent_calls) = counting_pool(4);
        let child = parent.subpool("child", 2);

        let a = child.get(0).await.unwrap();
        let b = child.get(1).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(child.size(), 2);
        // The first take starts every parent slot; the second may refill one.
        assert!(parent_calls.load(Ordering::SeqCst) >= 4);
        assert!(parent.size() <= 3);
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let (pool, _) = counting_pool(2);
        let mut changes = pool.subscribe();
        pool.get(0).await.unwrap();

        let msg = changes.recv().await.unwrap();
        assert_eq!(msg.payload, PoolFlow { pool: "test".into(), size: 1, capacity: 2 });
    }
}
