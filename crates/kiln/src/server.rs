// src/server.rs
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Instant;

use libc::c_int;

use crate::config::{DispatchModel, ServerConfig};
use crate::conn::{ConnSettings, HttpConn, SharedConn, lock_conn};
use crate::error::{KilnError, KilnResult};
use crate::http::BUSY_RESPONSE;
use crate::router::RouteTable;
use crate::slab::ConnectionSlab;
use crate::store::{CredentialStore, MemoryStore, PooledStore};
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};
use crate::timer::TimerList;
use crate::worker::{Completion, Phase, WorkItem, WorkerPool};
use crossbeam_channel::Receiver;

pub const LISTEN_TOKEN: u64 = u64::MAX;
pub const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENT_NUMBER: usize = 10_000;

/// Build the credential store the configuration asks for.
pub fn open_store(config: &ServerConfig) -> KilnResult<Arc<dyn CredentialStore>> {
    match &config.users_file {
        Some(path) => Ok(Arc::new(PooledStore::open_file(path, config.store_pool_size)?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

struct Listener {
    fd: c_int,
}

impl Drop for Listener {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}

/// Asks a running server to stop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<UnixStream>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = (&*self.tx).write(&[libc::SIGINT as u8]);
    }
}

/// The event loop: owns the listener, the epoll instance, every connection
/// slot, the idle timers and the worker pool.
pub struct Server {
    config: ServerConfig,
    listener: Listener,
    local_addr: SocketAddr,
    epoll: Arc<Epoll>,
    signal_rx: UnixStream,
    signal_tx: Arc<UnixStream>,
    slab: ConnectionSlab,
    timers: TimerList,
    pool: WorkerPool<WorkItem>,
    sweep_due: bool,
    stop: bool,
}

impl Server {
    pub fn bind(config: ServerConfig, store: Arc<dyn CredentialStore>) -> KilnResult<Self> {
        Self::bind_with_routes(config, store, RouteTable::default())
    }

    /// Bind the listener, install signal forwarding and start the workers.
    pub fn bind_with_routes(
        config: ServerConfig,
        store: Arc<dyn CredentialStore>,
        routes: RouteTable,
    ) -> KilnResult<Self> {
        config.validate()?;

        let listener = Listener {
            fd: syscalls::create_listen_socket(&config.host, config.port, config.opt_linger)?,
        };
        let local_addr = syscalls::local_addr(listener.fd)?;

        let epoll = Arc::new(Epoll::new()?);
        let mut listen_interests = EPOLLIN | EPOLLRDHUP;
        if config.listen_trigger.is_edge() {
            listen_interests |= EPOLLET;
        }
        epoll.add(listener.fd, LISTEN_TOKEN, listen_interests)?;

        let (signal_rx, signal_tx) = UnixStream::pair()?;
        signal_rx.set_nonblocking(true)?;
        signal_tx.set_nonblocking(true)?;
        epoll.add(signal_rx.as_raw_fd(), SIGNAL_TOKEN, EPOLLIN | EPOLLRDHUP)?;

        let settings = Arc::new(ConnSettings {
            doc_root: config.doc_root.clone(),
            trigger: config.conn_trigger,
            routes,
        });
        let slab = ConnectionSlab::new(config.max_connections, |slot| {
            HttpConn::new(slot, epoll.clone(), settings.clone(), store.clone())
        });
        let timers = TimerList::with_capacity(config.max_connections);
        let pool = WorkerPool::new(config.thread_num, config.max_requests, config.pin_workers)?;
        syscalls::install_signal_forwarding(signal_tx.as_raw_fd())?;

        tracing::info!(
            addr = %local_addr,
            root = %config.doc_root.display(),
            dispatch = ?config.dispatch,
            listen_trigger = ?config.listen_trigger,
            conn_trigger = ?config.conn_trigger,
            max_connections = config.max_connections,
            "kiln listening"
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            epoll,
            signal_rx,
            signal_tx: Arc::new(signal_tx),
            slab,
            timers,
            pool,
            sweep_due: false,
            stop: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.signal_tx.clone(),
        }
    }

    /// Live connections.
    pub fn connections(&self) -> usize {
        self.slab.len()
    }

    /// Serve until SIGTERM, SIGINT or a [`ShutdownHandle`] stops the loop.
    /// Every open connection is closed before returning.
    pub fn run(&mut self) -> KilnResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        syscalls::schedule_alarm(self.config.timeslot_secs);

        while !self.stop {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "epoll wait failed");
                    self.close_all();
                    return Err(e);
                }
            };

            for i in 0..n {
                // epoll_event is packed; copy fields out instead of borrowing.
                let token = events[i].u64;
                let flags = events[i].events;

                if token == LISTEN_TOKEN {
                    self.deal_client_data();
                } else if token == SIGNAL_TOKEN {
                    if flags & EPOLLIN as u32 != 0 {
                        self.deal_with_signal();
                    }
                } else if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.evict(token as usize);
                } else if flags & EPOLLIN as u32 != 0 {
                    self.deal_with_read(token as usize);
                } else if flags & EPOLLOUT as u32 != 0 {
                    self.deal_with_write(token as usize);
                }
            }

            if self.sweep_due {
                self.timer_handler();
                self.sweep_due = false;
            }
        }

        tracing::info!(open = self.slab.len(), "shutting down");
        self.close_all();
        self.pool.shutdown();
        Ok(())
    }

    fn deal_client_data(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.config.listen_trigger.is_edge() {
                break;
            }
        }
    }

    fn admit(&mut self, fd: c_int, peer: Option<SocketAddr>) {
        let Some((slot, generation)) = self.slab.allocate() else {
            tracing::warn!(peer = ?peer, error = %KilnError::SlabFull, "Internal server busy");
            syscalls::send_best_effort(fd, BUSY_RESPONSE);
            syscalls::close_fd(fd);
            return;
        };
        let Some(conn) = self.slab.get(slot).cloned() else {
            syscalls::close_fd(fd);
            return;
        };

        if let Err(e) = lock_conn(&conn).init(fd, peer, generation) {
            tracing::error!(slot, error = %e, "failed to register connection");
            syscalls::close_fd(fd);
            self.slab.free(slot);
            return;
        }
        self.timers
            .add_timer(slot, Instant::now() + self.config.idle_timeout());
        tracing::debug!(slot, peer = ?peer, "accepted connection");
    }

    fn deal_with_signal(&mut self) {
        let mut signals = [0u8; 1024];
        loop {
            match (&self.signal_rx).read(&mut signals) {
                Ok(0) => break,
                Ok(n) => {
                    for &sig in &signals[..n] {
                        match sig as c_int {
                            libc::SIGALRM => self.sweep_due = true,
                            libc::SIGTERM | libc::SIGINT => self.stop = true,
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "signal socket read failed");
                    break;
                }
            }
        }
    }

    fn deal_with_read(&mut self, slot: usize) {
        let Some((conn, generation)) = self.live_conn(slot) else {
            return;
        };

        match self.config.dispatch {
            DispatchModel::Reactor => {
                self.adjust_timer(slot);
                let (item, done) = WorkItem::reactor(conn, generation, Phase::Read);
                self.dispatch_and_wait(slot, item, done);
            }
            DispatchModel::Proactor => {
                let read = lock_conn(&conn).read_once();
                if !read {
                    self.evict(slot);
                    return;
                }
                if let Err(e) = self.pool.append(WorkItem::proactor(conn, generation)) {
                    tracing::warn!(slot, error = %e, "dropping connection");
                    self.evict(slot);
                    return;
                }
                self.adjust_timer(slot);
            }
        }
    }

    fn deal_with_write(&mut self, slot: usize) {
        let Some((conn, generation)) = self.live_conn(slot) else {
            return;
        };

        match self.config.dispatch {
            DispatchModel::Reactor => {
                self.adjust_timer(slot);
                let (item, done) = WorkItem::reactor(conn, generation, Phase::Write);
                self.dispatch_and_wait(slot, item, done);
            }
            DispatchModel::Proactor => {
                let written = lock_conn(&conn).write();
                if written {
                    self.adjust_timer(slot);
                } else {
                    self.evict(slot);
                }
            }
        }
    }

    /// Reactor hand-off: the loop does not touch the connection again until
    /// the worker reports back.
    fn dispatch_and_wait(
        &mut self,
        slot: usize,
        item: WorkItem,
        done: Receiver<Completion>,
    ) {
        if let Err(e) = self.pool.append(item) {
            tracing::warn!(slot, error = %e, "dropping connection");
            self.evict(slot);
            return;
        }
        match done.recv() {
            Ok(completion) if !completion.io_failed => {}
            _ => self.evict(slot),
        }
    }

    fn live_conn(&self, slot: usize) -> Option<(SharedConn, u64)> {
        if !self.slab.is_live(slot) {
            return None;
        }
        let conn = self.slab.get(slot)?.clone();
        let generation = self.slab.generation(slot)?;
        Some((conn, generation))
    }

    fn adjust_timer(&mut self, slot: usize) {
        let expire = Instant::now() + self.config.idle_timeout();
        if self.timers.adjust_timer(slot, expire) {
            tracing::trace!(slot, "timer adjusted");
        }
    }

    /// Close a connection for any reason and give its slot back.
    fn evict(&mut self, slot: usize) {
        if !self.slab.is_live(slot) {
            return;
        }
        self.timers.del_timer(slot);
        release_slot(&mut self.slab, slot);
    }

    fn timer_handler(&mut self) {
        let now = Instant::now();
        let Self { timers, slab, .. } = self;
        let evicted = timers.tick(now, |slot| {
            tracing::debug!(slot, "idle connection evicted");
            release_slot(slab, slot);
        });
        if evicted > 0 {
            tracing::info!(evicted, open = self.slab.len(), "timer tick");
        }
        syscalls::schedule_alarm(self.config.timeslot_secs);
    }

    fn close_all(&mut self) {
        let live: Vec<usize> = self.slab.live_indices().collect();
        for slot in live {
            self.evict(slot);
        }
    }
}

fn release_slot(slab: &mut ConnectionSlab, slot: usize) {
    if let Some(conn) = slab.get(slot) {
        lock_conn(conn).close_conn();
    }
    slab.free(slot);
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::clear_signal_forwarding(self.signal_tx.as_raw_fd());
        let _ = self.epoll.delete(self.listener.fd);
    }
}
