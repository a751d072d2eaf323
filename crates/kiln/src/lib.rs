// src/lib.rs
//! epoll-driven HTTP/1.1 server for static pages and credential forms.
//!
//! One event-loop thread multiplexes every socket; a fixed [`WorkerPool`]
//! runs request handling, and in the reactor model the socket I/O as well.
//! Idle connections are reaped by a [`TimerList`] swept on a periodic alarm.
//!
//! Linux only.

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod parser;
pub mod router;
pub mod server;
pub mod slab;
pub mod store;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::{DispatchModel, LogFormat, ServerConfig, TriggerMode};
pub use conn::{ConnSettings, HttpConn, SharedConn};
pub use error::{KilnError, KilnResult};
pub use http::{HttpCode, Method};
pub use router::RouteTable;
pub use server::{Server, ShutdownHandle, open_store};
pub use store::{CredentialStore, FileBackend, InsertOutcome, MemoryStore, PooledStore, UserBackend};
pub use timer::TimerList;
pub use worker::{Completion, Job, Phase, WorkItem, WorkerPool};
