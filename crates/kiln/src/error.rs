use std::io;

use thiserror::Error;

/// Central error type for the kiln engine.
///
/// HTTP-level outcomes (bad request, missing file, ...) are not errors here;
/// they are [`HttpCode`](crate::http::HttpCode) classifications that turn
/// into responses.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The worker queue already holds `max_requests` items.
    #[error("work queue is full")]
    QueueFull,
    /// Every connection slot is in use.
    #[error("connection slab is full")]
    SlabFull,
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// The credential backend rejected an operation.
    #[error("credential store error: {0}")]
    Store(String),
    /// The backend handle pool failed.
    #[error("resource pool error: {0}")]
    Pool(#[from] kiln_pool::PoolError),
}

pub type KilnResult<T> = Result<T, KilnError>;
