// src/worker.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::conn::{SharedConn, lock_conn};
use crate::error::{KilnError, KilnResult};

/// A unit of work a pool thread runs to completion.
pub trait Job: Send + 'static {
    fn run(self);
}

struct Queue<J> {
    jobs: VecDeque<J>,
    shutdown: bool,
}

struct Shared<J> {
    queue: Mutex<Queue<J>>,
    available: Condvar,
    max_requests: usize,
}

impl<J> Shared<J> {
    fn lock(&self) -> MutexGuard<'_, Queue<J>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of threads draining one FIFO queue.
///
/// The queue holds at most `max_requests` jobs; [`append`](Self::append)
/// fails instead of blocking once it is full. Idle threads sleep on a
/// condition variable.
pub struct WorkerPool<J: Job> {
    shared: Arc<Shared<J>>,
    handles: Vec<JoinHandle<()>>,
}

impl<J: Job> WorkerPool<J> {
    /// Start `threads` workers. With `pin` set, worker `i` is pinned to core
    /// `i % cores`.
    pub fn new(threads: usize, max_requests: usize, pin: bool) -> KilnResult<Self> {
        if threads == 0 || max_requests == 0 {
            return Err(KilnError::Config(
                "worker pool needs at least one thread and one queue slot".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(max_requests.min(1024)),
                shutdown: false,
            }),
            available: Condvar::new(),
            max_requests,
        });

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("kiln-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(shared);
                })?;
            pool.handles.push(handle);
        }
        tracing::info!(threads, max_requests, "worker pool started");
        Ok(pool)
    }

    /// Queue a job. Never blocks.
    pub fn append(&self, job: J) -> KilnResult<()> {
        let mut queue = self.shared.lock();
        if queue.shutdown || queue.jobs.len() >= self.shared.max_requests {
            return Err(KilnError::QueueFull);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Let workers finish what is queued, then join them.
    pub fn shutdown(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<J: Job>(shared: Arc<Shared<J>>) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            tracing::error!("worker job panicked");
        }
    }
}

/// What a work item does with its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reactor: read from the socket, then handle the request.
    Read,
    /// Reactor: flush the pending response.
    Write,
    /// Proactor: handle a request the event loop already read.
    Process,
}

/// Reported back to the event loop by reactor items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub io_failed: bool,
}

/// The server's job: one phase of work on one connection slot.
pub struct WorkItem {
    conn: SharedConn,
    generation: u64,
    phase: Phase,
    done: Option<Sender<Completion>>,
}

impl WorkItem {
    /// A reactor item and the receiver its completion arrives on. The
    /// receiver reports a disconnect if the item is dropped unrun.
    pub fn reactor(conn: SharedConn, generation: u64, phase: Phase) -> (Self, Receiver<Completion>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let item = Self {
            conn,
            generation,
            phase,
            done: Some(tx),
        };
        (item, rx)
    }

    pub fn proactor(conn: SharedConn, generation: u64) -> Self {
        Self {
            conn,
            generation,
            phase: Phase::Process,
            done: None,
        }
    }
}

impl Job for WorkItem {
    fn run(self) {
        let io_failed = {
            let mut conn = lock_conn(&self.conn);
            if conn.generation() != self.generation {
                // The slot was evicted and handed to a new connection.
                tracing::trace!(slot = conn.slot(), phase = ?self.phase, "skipping stale work item");
                false
            } else if !conn.is_open() {
                true
            } else {
                match self.phase {
                    Phase::Read => {
                        if conn.read_once() {
                            conn.process();
                            false
                        } else {
                            true
                        }
                    }
                    Phase::Write => !conn.write(),
                    Phase::Process => {
                        conn.process();
                        false
                    }
                }
            }
        };

        if let Some(done) = self.done {
            let _ = done.send(Completion { io_failed });
        }
    }
}
