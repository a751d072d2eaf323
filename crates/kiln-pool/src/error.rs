use thiserror::Error;

/// Errors returned by kiln-pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool was drained; no handle will ever become available again.
    #[error("resource pool is closed")]
    Closed,
    /// No handle was released before the deadline.
    #[error("timed out waiting for a free resource")]
    Timeout,
    /// Non-blocking acquisition found no free handle.
    #[error("no free resource available")]
    Exhausted,
}

pub type PoolResult<T> = Result<T, PoolError>;
