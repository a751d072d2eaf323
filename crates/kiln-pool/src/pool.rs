//! Shared resource pool with a counting gate.
//!
//! Handles are created up front and live as long as the pool. The gate's
//! permit count always equals the number of idle handles, so a caller that
//! got past the gate is guaranteed to find one in the free list.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{PoolError, PoolResult};
use crate::semaphore::Semaphore;

struct FreeList<R> {
    idle: VecDeque<R>,
    in_use: usize,
    closed: bool,
}

/// A fixed-size pool of long-lived handles.
///
/// `available() + in_use() == capacity()` holds between calls until the
/// pool is drained.
pub struct Pool<R> {
    free: Mutex<FreeList<R>>,
    gate: Semaphore,
    capacity: usize,
}

impl<R> Pool<R> {
    /// Create a pool that owns the given handles.
    pub fn new(resources: Vec<R>) -> Self {
        let capacity = resources.len();
        Self {
            free: Mutex::new(FreeList {
                idle: resources.into(),
                in_use: 0,
                closed: false,
            }),
            gate: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Create a pool by opening `size` handles eagerly. The first failure aborts
    /// construction and drops the handles opened so far.
    pub fn build<E, F>(size: usize, mut open: F) -> Result<Self, E>
    where
        F: FnMut(usize) -> Result<R, E>,
    {
        let mut resources = Vec::with_capacity(size);
        for i in 0..size {
            resources.push(open(i)?);
        }
        Ok(Self::new(resources))
    }

    fn lock(&self) -> MutexGuard<'_, FreeList<R>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a handle, blocking while none is free. There is no deadline;
    /// use [`acquire_timeout`](Self::acquire_timeout) to bound the wait.
    pub fn acquire(&self) -> PoolResult<PoolGuard<'_, R>> {
        self.gate.acquire()?;
        self.take()
    }

    pub fn try_acquire(&self) -> PoolResult<PoolGuard<'_, R>> {
        self.gate.try_acquire()?;
        self.take()
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PoolGuard<'_, R>> {
        self.gate.acquire_timeout(timeout)?;
        self.take()
    }

    // Caller holds a gate permit, so `idle` is non-empty unless the pool was
    // drained in between.
    fn take(&self) -> PoolResult<PoolGuard<'_, R>> {
        let mut free = self.lock();
        let resource = free.idle.pop_front().ok_or(PoolError::Closed)?;
        free.in_use += 1;
        Ok(PoolGuard {
            pool: self,
            resource: Some(resource),
        })
    }

    /// Hand a handle back and wake one blocked acquirer.
    pub fn release(&self, resource: R) {
        let mut free = self.lock();
        free.in_use = free.in_use.saturating_sub(1);
        if free.closed {
            drop(free);
            drop(resource);
            return;
        }
        free.idle.push_back(resource);
        drop(free);
        self.gate.release();
    }

    /// Number of idle handles.
    pub fn available(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the pool: drop every idle handle, fail all waiters, and drop
    /// checked-out handles as they come back. Returns the number of idle
    /// handles closed.
    pub fn drain(&self) -> usize {
        let mut free = self.lock();
        free.closed = true;
        let idle: Vec<R> = free.idle.drain(..).collect();
        drop(free);
        self.gate.close();
        let closed = idle.len();
        drop(idle);
        tracing::debug!(closed, "resource pool drained");
        closed
    }
}

/// A checked-out handle. Returns itself to the pool on drop.
pub struct PoolGuard<'a, R> {
    pool: &'a Pool<R>,
    resource: Option<R>,
}

impl<R> Deref for PoolGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource
            .as_ref()
            .expect("pool guard holds its resource until dropped")
    }
}

impl<R> DerefMut for PoolGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .expect("pool guard holds its resource until dropped")
    }
}

impl<R> Drop for PoolGuard<'_, R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, mpsc};
    use std::thread;

    #[test]
    fn test_acquire_release_keeps_accounting() {
        let pool = Pool::new(vec![1u32, 2, 3]);
        assert_eq!(pool.capacity(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available() + pool.in_use(), pool.capacity());

        drop(a);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_try_acquire_reports_exhaustion() {
        let pool = Pool::new(vec!["only"]);
        let held = pool.try_acquire().unwrap();
        assert_eq!(*held, "only");
        assert_eq!(pool.try_acquire().err(), Some(PoolError::Exhausted));
        drop(held);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn test_excess_acquirers_block_until_release() {
        let pool = Arc::new(Pool::new(vec![0u8, 1]));
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();

        let (acquired_tx, acquired_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let finish_rx = Arc::new(std::sync::Mutex::new(finish_rx));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            let acquired_tx = acquired_tx.clone();
            let finish_rx = finish_rx.clone();
            waiters.push(thread::spawn(move || {
                let _guard = pool.acquire().unwrap();
                acquired_tx.send(()).unwrap();
                let _ = finish_rx.lock().unwrap().recv();
            }));
        }

        thread::sleep(Duration::from_millis(100));
        assert!(acquired_rx.try_recv().is_err(), "waiters must block while pool is empty");

        drop(first);
        acquired_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(acquired_rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(second);
        acquired_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(acquired_rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Let one holder go; its handle unblocks the last waiter.
        finish_tx.send(()).unwrap();
        acquired_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        finish_tx.send(()).unwrap();
        finish_tx.send(()).unwrap();
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_drain_closes_idle_and_returning_handles() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicUsize::new(0));
        let pool = Pool::build(3, |_| Ok::<_, ()>(Tracked(closed.clone()))).unwrap();
        let held = pool.acquire().unwrap();

        assert_eq!(pool.drain(), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.acquire().err(), Some(PoolError::Closed));

        drop(held);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_build_propagates_open_failure() {
        let result: Result<Pool<usize>, String> = Pool::build(4, |i| {
            if i == 2 {
                Err(format!("handle {} failed", i))
            } else {
                Ok(i)
            }
        });
        assert_eq!(result.err().as_deref(), Some("handle 2 failed"));
    }
}
