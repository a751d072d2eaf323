//! Credential storage.
//!
//! Connections see a [`CredentialStore`] handle injected at construction.
//! The pooled store keeps an in-memory copy of every user, warmed once at
//! startup, and pushes writes through a [`Pool`] of backend handles.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_pool::{Pool, PoolGuard};

use crate::error::{KilnError, KilnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// User name to password lookup shared by every worker.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, user: &str) -> Option<String>;

    /// Insert `user` unless it already exists. Errors mean the backend
    /// refused the write; the user is not recorded.
    fn insert(&self, user: &str, password: &str) -> KilnResult<InsertOutcome>;
}

fn lock_users(users: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
    users.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: Mutex::new(
                users
                    .into_iter()
                    .map(|(u, p)| (u.into(), p.into()))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        lock_users(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryStore {
    fn lookup(&self, user: &str) -> Option<String> {
        lock_users(&self.users).get(user).cloned()
    }

    fn insert(&self, user: &str, password: &str) -> KilnResult<InsertOutcome> {
        let mut users = lock_users(&self.users);
        if users.contains_key(user) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        users.insert(user.to_string(), password.to_string());
        Ok(InsertOutcome::Inserted)
    }
}

/// A persistent user table reachable through one handle.
pub trait UserBackend: Send {
    /// Every stored `(user, password)` pair.
    fn load_all(&mut self) -> KilnResult<Vec<(String, String)>>;

    fn append(&mut self, user: &str, password: &str) -> KilnResult<()>;
}

/// Flat file of `user<TAB>password` lines. Each handle holds its own
/// append-mode descriptor, so concurrent appends never interleave.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
}

impl FileBackend {
    /// Open (creating if missing) the user file at `path`.
    pub fn open(path: impl AsRef<Path>) -> KilnResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }
}

impl UserBackend for FileBackend {
    fn load_all(&mut self) -> KilnResult<Vec<(String, String)>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut users = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((user, password)) => users.push((user.to_string(), password.to_string())),
                None => {
                    tracing::warn!(path = %self.path.display(), line = lineno + 1, "skipping malformed user record");
                }
            }
        }
        Ok(users)
    }

    fn append(&mut self, user: &str, password: &str) -> KilnResult<()> {
        let forbidden = |s: &str| s.contains(['\t', '\n', '\r']);
        if forbidden(user) || forbidden(password) {
            return Err(KilnError::Store(
                "user names and passwords may not contain tabs or line breaks".into(),
            ));
        }
        // One write call per record keeps O_APPEND writes whole.
        let record = format!("{}\t{}\n", user, password);
        self.file.write_all(record.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// Store backed by a pool of [`UserBackend`] handles with an in-memory cache.
pub struct PooledStore<B> {
    pool: Pool<B>,
    cache: Mutex<HashMap<String, String>>,
    acquire_timeout: Option<Duration>,
}

impl<B: UserBackend> PooledStore<B> {
    /// Open `size` backend handles and warm the cache from the first one.
    pub fn open<F>(size: usize, open: F) -> KilnResult<Self>
    where
        F: FnMut(usize) -> KilnResult<B>,
    {
        if size == 0 {
            return Err(KilnError::Config("store pool size must be at least 1".into()));
        }
        let pool = Pool::build(size, open)?;
        let users = pool.acquire()?.load_all()?;
        tracing::info!(handles = size, users = users.len(), "credential store ready");
        Ok(Self {
            pool,
            cache: Mutex::new(users.into_iter().collect()),
            acquire_timeout: None,
        })
    }

    /// Fail inserts with [`kiln_pool::PoolError::Timeout`] instead of waiting
    /// forever for a free handle.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn handle(&self) -> KilnResult<PoolGuard<'_, B>> {
        let guard = match self.acquire_timeout {
            Some(timeout) => self.pool.acquire_timeout(timeout)?,
            None => self.pool.acquire()?,
        };
        Ok(guard)
    }

    pub fn pool(&self) -> &Pool<B> {
        &self.pool
    }

    /// Close every backend handle. Later inserts fail.
    pub fn drain(&self) -> usize {
        self.pool.drain()
    }
}

impl PooledStore<FileBackend> {
    pub fn open_file(path: impl AsRef<Path>, size: usize) -> KilnResult<Self> {
        let path = path.as_ref();
        Self::open(size, |_| FileBackend::open(path))
    }
}

impl<B: UserBackend> CredentialStore for PooledStore<B> {
    fn lookup(&self, user: &str) -> Option<String> {
        lock_users(&self.cache).get(user).cloned()
    }

    fn insert(&self, user: &str, password: &str) -> KilnResult<InsertOutcome> {
        // Registration is serialized on the cache lock so two racing
        // requests for the same name cannot both pass the check.
        let mut cache = lock_users(&self.cache);
        if cache.contains_key(user) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.handle()?.append(user, password)?;
        cache.insert(user.to_string(), password.to_string());
        Ok(InsertOutcome::Inserted)
    }
}
