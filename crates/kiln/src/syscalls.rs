// src/syscalls.rs
//
// Thin wrappers over the Linux socket, epoll, signal and mmap calls the
// server is built on. Everything here is non-blocking unless stated.
use crate::error::KilnResult;
use libc::{c_int, c_void, socklen_t};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

pub use libc::{
    EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event,
};

// ---- Socket Operations ----

/// Create a non-blocking TCP listener.
///
/// - SO_REUSEADDR so restarts do not trip over TIME_WAIT
/// - SO_LINGER: `abortive == false` leaves lingering off (close returns at once,
///   the kernel drains the send queue); `true` enables a 1 second linger.
///   Accepted sockets inherit the setting.
pub fn create_listen_socket(host: &str, port: u16, abortive: bool) -> KilnResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid address"))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let linger = libc::linger {
            l_onoff: abortive as c_int,
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address. Closes `fd` on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> KilnResult<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(())
    }
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Address a bound socket actually listens on (resolves port 0).
pub fn local_addr(fd: c_int) -> KilnResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        to_socket_addr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "unknown address family").into()
        })
    }
}

/// Accept a non-blocking connection. `Ok(None)` once the backlog is empty.
pub fn accept_connection(listen_fd: c_int) -> KilnResult<Option<(c_int, Option<SocketAddr>)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some((fd, to_socket_addr(&storage))))
        }
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> KilnResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` with the given interest set. Trigger mode and one-shot
    /// flags are part of `interests`.
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> KilnResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness. `timeout_ms == -1` blocks indefinitely. A signal
    /// interrupting the wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> KilnResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Data Transfer ----

/// Receive into `buf`. `Ok(Some(0))` means the peer closed, `Ok(None)` means
/// the socket has nothing more to give right now.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> KilnResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write: send multiple buffers in a single syscall (scatter-gather I/O).
/// `Ok(None)` when the send queue is full.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> KilnResult<Option<usize>> {
    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    // sendmsg instead of writev so a vanished peer yields EPIPE, not SIGPIPE.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iov_count as _;

    loop {
        let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Fire-and-forget send used for the busy notice; partial sends are ignored.
pub fn send_best_effort(fd: c_int, data: &[u8]) {
    unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const c_void,
            data.len(),
            libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
        );
    }
}

// ---- Signal Forwarding ----

/// Write end of the socket pair signal handlers report into.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();
        let fd = SIGNAL_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(
                fd,
                &byte as *const u8 as *const c_void,
                1,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            );
        }
        *libc::__errno_location() = saved_errno;
    }
}

fn set_handler(sig: c_int, handler: libc::sighandler_t) -> KilnResult<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        // Restart interrupted calls in other threads; epoll_wait still
        // returns EINTR, and the byte in the socket wakes the loop anyway.
        action.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Route SIGALRM and SIGTERM into `write_fd` as one byte each (the signal
/// number) and ignore SIGPIPE. One forwarding target per process.
pub fn install_signal_forwarding(write_fd: c_int) -> KilnResult<()> {
    SIGNAL_FD.store(write_fd, Ordering::Release);
    let handler = forward_signal as extern "C" fn(c_int) as libc::sighandler_t;
    set_handler(libc::SIGPIPE, libc::SIG_IGN)?;
    set_handler(libc::SIGALRM, handler)?;
    set_handler(libc::SIGTERM, handler)?;
    Ok(())
}

/// Stop forwarding into `write_fd` if it is still the registered target.
pub fn clear_signal_forwarding(write_fd: c_int) {
    let _ = SIGNAL_FD.compare_exchange(write_fd, -1, Ordering::AcqRel, Ordering::Relaxed);
}

/// Deliver SIGALRM to this process after `secs` seconds.
pub fn schedule_alarm(secs: u64) {
    unsafe {
        libc::alarm(secs.min(libc::c_uint::MAX as u64) as libc::c_uint);
    }
}

// ---- Memory-Mapped Files ----

/// Read-only private mapping of a whole file.
pub struct MappedFile {
    addr: *mut c_void,
    len: usize,
}

// The mapping is read-only and owned by exactly one MappedFile.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map the first `len` bytes of `path`. `len` must be non-zero.
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        // The descriptor is closed when `file` drops; the mapping stays valid.
        let file = File::open(path)?;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}
