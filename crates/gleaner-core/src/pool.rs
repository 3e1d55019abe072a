//! Bounded pool of expensive, reusable resources (headless browsers).
//!
//! At most `capacity` resources are ever checked out at once. Waiters queue
//! on a fair semaphore and are served in FIFO order as handles come back;
//! nobody polls. Resources are created lazily, reused most-recently-used
//! first, and evicted by [`ResourcePool::reap_idle`] once idle for too long.
//!
//! ```text
//! acquire ──permit──> idle? ──yes──> reuse
//!                        └──no───> factory.create()
//! drop(handle) ──> back to idle (or destroyed if the pool is shut down)
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Creates and destroys pooled resources.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Resource, AppError>> + Send;

    fn destroy(&self, resource: Self::Resource) -> impl Future<Output = ()> + Send;
}

struct IdleEntry<R> {
    id: u64,
    resource: R,
    last_used_at: Instant,
}

struct PoolState<R> {
    idle: VecDeque<IdleEntry<R>>,
    in_use: usize,
    peak_in_use: usize,
    created: u64,
    destroyed: u64,
    next_id: u64,
    closed: bool,
}

impl<R> PoolState<R> {
    fn check_out(&mut self) {
        self.in_use += 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
    }
}

struct PoolInner<F: ResourceFactory> {
    name: String,
    factory: F,
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<F::Resource>>,
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(pool = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Destroy a resource from a synchronous context (handle drop).
    fn destroy_detached(self: &Arc<Self>, resource: F::Resource) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn(async move {
                    inner.factory.destroy(resource).await;
                });
            }
            Err(_) => drop(resource),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    /// Resources currently alive (idle + in use).
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Highest `in_use` ever observed.
    pub peak_in_use: usize,
    pub created: u64,
    pub destroyed: u64,
}

/// Bounded pool of resources produced by a [`ResourceFactory`].
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create an empty pool. A capacity of 0 is raised to 1.
    pub fn new(name: impl Into<String>, factory: F, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                factory,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: 0,
                    peak_in_use: 0,
                    created: 0,
                    destroyed: 0,
                    next_id: 1,
                    closed: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Check out a resource, waiting in FIFO order while the pool is exhausted.
    ///
    /// Creation failures propagate to the caller and give the slot back.
    pub async fn acquire(&self) -> Result<ResourceHandle<F>, AppError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::PoolClosed)?;

        let reused = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(AppError::PoolClosed);
            }
            let entry = state.idle.pop_back();
            if entry.is_some() {
                state.check_out();
            }
            entry
        };

        if let Some(entry) = reused {
            tracing::debug!(pool = %self.inner.name, resource_id = entry.id, "Reusing idle resource");
            return Ok(ResourceHandle {
                id: entry.id,
                resource: Some(entry.resource),
                acquired_at: Instant::now(),
                pool: Arc::clone(&self.inner),
                _permit: permit,
            });
        }

        let resource = self.inner.factory.create().await.map_err(|e| {
            tracing::warn!(pool = %self.inner.name, error = %e, "Failed to create resource");
            e
        })?;

        let registered = {
            let mut state = self.inner.lock_state();
            if state.closed {
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.created += 1;
                state.check_out();
                Some(id)
            }
        };
        let Some(id) = registered else {
            self.inner.factory.destroy(resource).await;
            return Err(AppError::PoolClosed);
        };

        tracing::info!(pool = %self.inner.name, resource_id = id, "Created resource");
        Ok(ResourceHandle {
            id,
            resource: Some(resource),
            acquired_at: Instant::now(),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Destroy idle resources unused for longer than `max_idle`.
    ///
    /// Checked-out resources are never touched. Returns the number destroyed.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<IdleEntry<F::Resource>> = {
            let mut state = self.inner.lock_state();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.last_used_at.elapsed() > max_idle);
            state.idle = fresh;
            state.destroyed += stale.len() as u64;
            stale.into_iter().collect()
        };

        let count = expired.len();
        for entry in expired {
            tracing::info!(pool = %self.inner.name, resource_id = entry.id, "Evicting idle resource");
            self.inner.factory.destroy(entry.resource).await;
        }
        count
    }

    /// Destroy every idle resource and refuse further acquisitions.
    ///
    /// Resources still checked out are destroyed as soon as their handle is dropped.
    pub async fn shutdown(&self) -> usize {
        self.inner.permits.close();
        let drained: Vec<IdleEntry<F::Resource>> = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.destroyed += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for entry in drained {
            self.inner.factory.destroy(entry.resource).await;
        }
        tracing::info!(pool = %self.inner.name, destroyed = count, "Resource pool shut down");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            capacity: self.inner.capacity,
            live: state.idle.len() + state.in_use,
            idle: state.idle.len(),
            in_use: state.in_use,
            peak_in_use: state.peak_in_use,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Periodically evict idle resources until `cancel` fires.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                let reaped = pool.reap_idle(max_idle).await;
                if reaped > 0 {
                    tracing::debug!(pool = %pool.name(), reaped, "Idle reaper pass");
                }
            }
        })
    }
}

/// A checked-out resource. Dropping the handle releases it back to the pool.
pub struct ResourceHandle<F: ResourceFactory> {
    id: u64,
    resource: Option<F::Resource>,
    acquired_at: Instant,
    pool: Arc<PoolInner<F>>,
    // Dropped after `Drop::drop` has put the resource back, so the next
    // waiter always finds it idle.
    _permit: OwnedSemaphorePermit,
}

impl<F: ResourceFactory> ResourceHandle<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Return the resource to the pool. Same as dropping the handle.
    pub fn release(self) {}

    /// Destroy the resource instead of returning it (e.g. after it crashed).
    pub async fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            {
                let mut state = self.pool.lock_state();
                state.in_use -= 1;
                state.destroyed += 1;
            }
            tracing::info!(pool = %self.pool.name, resource_id = self.id, "Discarding resource");
            self.pool.factory.destroy(resource).await;
        }
    }
}

impl<F: ResourceFactory> Deref for ResourceHandle<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the resource, and both consume the handle.
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("resource handle used after release"),
        }
    }
}

impl<F: ResourceFactory> Drop for ResourceHandle<F> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let mut state = self.pool.lock_state();
        state.in_use -= 1;
        if state.closed {
            state.destroyed += 1;
            drop(state);
            self.pool.destroy_detached(resource);
        } else {
            state.idle.push_back(IdleEntry {
                id: self.id,
                resource,
                last_used_at: Instant::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testutil::MockResourceFactory;

    #[tokio::test]
    async fn creates_lazily_and_reuses_idle() {
        let factory = MockResourceFactory::new();
        let pool = ResourcePool::new("test", factory.clone(), 2);
        assert_eq!(pool.stats().live, 0);

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        drop(first);
        let again = pool.acquire().await.unwrap();

        assert_eq!(again.id(), first_id);
        assert_eq!(factory.created(), 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn in_use_never_exceeds_capacity() {
        let pool = ResourcePool::new("test", MockResourceFactory::new(), 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let handle = pool.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(pool.stats().in_use <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(handle);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let stats = pool.stats();
        assert!(stats.peak_in_use <= 2);
        assert!(stats.created <= 2);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_fifo_order() {
        let pool = ResourcePool::new("test", MockResourceFactory::new(), 1);
        let held = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for name in ["first", "second", "third"] {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _handle = pool.acquire().await.unwrap();
                order.lock().unwrap().push(name);
            }));
            // Let this waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn creation_failure_propagates_and_frees_the_slot() {
        let factory = MockResourceFactory::failing_first(1);
        let pool = ResourcePool::new("test", factory.clone(), 1);

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, AppError::ResourceCreation(_)));
        assert_eq!(pool.stats().in_use, 0);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(factory.created(), 1);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_idle_only_evicts_stale_free_handles() {
        let factory = MockResourceFactory::new();
        let pool = ResourcePool::new("test", factory.clone(), 2);
        let busy = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        drop(idle);

        assert_eq!(pool.reap_idle(Duration::from_secs(60)).await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.reap_idle(Duration::from_secs(60)).await, 1);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(factory.destroyed(), 1);
        drop(busy);
    }

    #[tokio::test]
    async fn handle_is_released_when_holder_panics() {
        let pool = ResourcePool::new("test", MockResourceFactory::new(), 1);
        let p = pool.clone();
        let result = tokio::spawn(async move {
            let _handle = p.acquire().await.unwrap();
            panic!("worker blew up");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(pool.stats().in_use, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_destroys_everything_and_rejects_acquire() {
        let factory = MockResourceFactory::new();
        let pool = ResourcePool::new("test", factory.clone(), 2);
        let held = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());

        assert_eq!(pool.shutdown().await, 1);
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(AppError::PoolClosed)));

        drop(held);
        // The detached destroy runs on the runtime.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.destroyed(), 2);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn discard_destroys_instead_of_returning() {
        let factory = MockResourceFactory::new();
        let pool = ResourcePool::new("test", factory.clone(), 1);
        let handle = pool.acquire().await.unwrap();
        handle.discard().await;

        assert_eq!(factory.destroyed(), 1);
        assert_eq!(pool.stats().live, 0);
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(factory.created(), 2);
        drop(fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_evicts_on_interval() {
        let factory = MockResourceFactory::new();
        let pool = ResourcePool::new("test", factory.clone(), 1);
        drop(pool.acquire().await.unwrap());

        let cancel = CancellationToken::new();
        let reaper = pool.spawn_reaper(
            Duration::from_secs(10),
            Duration::from_secs(30),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(45)).await;
        cancel.cancel();
        reaper.await.unwrap();

        assert_eq!(factory.destroyed(), 1);
    }
}
