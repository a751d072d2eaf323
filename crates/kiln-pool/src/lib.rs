//! # kiln-pool
//!
//! A fixed-size pool of long-lived resource handles shared by many threads.
//!
//! ## Features
//! - **Bounded**: the pool never hands out more handles than it was built with.
//! - **Blocking acquisition**: callers park on a counting gate until a handle is free.
//! - **RAII release**: a [`PoolGuard`] returns its handle when dropped.

pub mod error;
pub mod pool;
pub mod semaphore;

pub use error::{PoolError, PoolResult};
pub use pool::{Pool, PoolGuard};
pub use semaphore::Semaphore;
