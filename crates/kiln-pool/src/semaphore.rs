// src/semaphore.rs
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{PoolError, PoolResult};

struct Permits {
    available: usize,
    closed: bool,
}

/// Counting gate. `acquire` parks the caller while the count is zero,
/// `release` bumps it and wakes exactly one parked caller.
pub struct Semaphore {
    permits: Mutex<Permits>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(available: usize) -> Self {
        Self {
            permits: Mutex::new(Permits {
                available,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Permits> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) -> PoolResult<()> {
        let mut permits = self.lock();
        loop {
            if permits.closed {
                return Err(PoolError::Closed);
            }
            if permits.available > 0 {
                permits.available -= 1;
                return Ok(());
            }
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_acquire(&self) -> PoolResult<()> {
        let mut permits = self.lock();
        if permits.closed {
            return Err(PoolError::Closed);
        }
        if permits.available == 0 {
            return Err(PoolError::Exhausted);
        }
        permits.available -= 1;
        Ok(())
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<()> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.lock();
        loop {
            if permits.closed {
                return Err(PoolError::Closed);
            }
            if permits.available > 0 {
                permits.available -= 1;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout);
            }
            permits = self
                .cond
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn release(&self) {
        let mut permits = self.lock();
        permits.available += 1;
        drop(permits);
        self.cond.notify_one();
    }

    /// Fail every current and future waiter with [`PoolError::Closed`].
    pub fn close(&self) {
        let mut permits = self.lock();
        permits.closed = true;
        permits.available = 0;
        drop(permits);
        self.cond.notify_all();
    }

    pub fn available(&self) -> usize {
        self.lock().available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permits_count_down_and_up() {
        let sem = Semaphore::new(2);
        sem.acquire().unwrap();
        sem.acquire().unwrap();
        assert_eq!(sem.try_acquire(), Err(PoolError::Exhausted));
        sem.release();
        assert_eq!(sem.available(), 1);
        sem.try_acquire().unwrap();
    }

    #[test]
    fn test_timeout_expires_without_release() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert_eq!(
            sem.acquire_timeout(Duration::from_millis(50)),
            Err(PoolError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        sem.close();
        assert_eq!(waiter.join().unwrap(), Err(PoolError::Closed));
    }
}
