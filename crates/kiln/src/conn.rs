// src/conn.rs
use std::fmt;
use std::net::SocketAddr;
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libc::c_int;

use crate::config::TriggerMode;
use crate::error::KilnResult;
use crate::http::{self, CheckState, HttpCode, Method};
use crate::parser::{self, Header, LineStatus};
use crate::router::{self, Action, Route, RouteTable};
use crate::store::{CredentialStore, InsertOutcome};
use crate::syscalls::{self, EPOLLIN, EPOLLET, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, MappedFile};

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Per-server settings every connection reads.
#[derive(Debug)]
pub struct ConnSettings {
    pub doc_root: PathBuf,
    pub trigger: TriggerMode,
    pub routes: RouteTable,
}

/// A connection slot shared between the event loop and the workers.
pub type SharedConn = Arc<Mutex<HttpConn>>;

/// Lock a slot. A worker that panicked mid-request leaves the connection in
/// an arbitrary state; eviction still has to be able to close it.
pub fn lock_conn(conn: &SharedConn) -> MutexGuard<'_, HttpConn> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One client connection: buffers, parser state and the pending response.
pub struct HttpConn {
    slot: usize,
    fd: c_int,
    peer: Option<SocketAddr>,
    generation: u64,
    epoll: Arc<Epoll>,
    settings: Arc<ConnSettings>,
    store: Arc<dyn CredentialStore>,

    read_buf: Box<[u8]>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    write_buf: Box<[u8]>,
    write_idx: usize,

    check_state: CheckState,
    method: Method,
    url: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    cgi: bool,
    body: Range<usize>,

    real_file: PathBuf,
    file: Option<MappedFile>,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("slot", &self.slot)
            .field("fd", &self.fd)
            .field("generation", &self.generation)
            .field("check_state", &self.check_state)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl HttpConn {
    /// A closed slot. Buffers are allocated here once and reused for every
    /// connection the slot serves.
    pub fn new(
        slot: usize,
        epoll: Arc<Epoll>,
        settings: Arc<ConnSettings>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            slot,
            fd: -1,
            peer: None,
            generation: 0,
            epoll,
            settings,
            store,
            read_buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: vec![0; WRITE_BUFFER_SIZE].into_boxed_slice(),
            write_idx: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: String::new(),
            host: None,
            content_length: 0,
            keep_alive: true,
            cgi: false,
            body: 0..0,
            real_file: PathBuf::new(),
            file: None,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Take ownership of an accepted socket and register it for reading.
    pub fn init(&mut self, fd: c_int, peer: Option<SocketAddr>, generation: u64) -> KilnResult<()> {
        self.fd = fd;
        self.peer = peer;
        self.generation = generation;
        self.reset();
        if let Err(e) = self.epoll.add(fd, self.slot as u64, self.interests(EPOLLIN)) {
            self.fd = -1;
            return Err(e);
        }
        Ok(())
    }

    /// Clear per-request state, keeping the socket.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.write_idx = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = true;
        self.cgi = false;
        self.body = 0..0;
        self.real_file.clear();
        self.file = None;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
        self.read_buf.fill(0);
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn interests(&self, ev: i32) -> i32 {
        let mut interests = ev | EPOLLONESHOT | EPOLLRDHUP;
        if self.settings.trigger.is_edge() {
            interests |= EPOLLET;
        }
        interests
    }

    /// Re-arm the one-shot registration for `ev`.
    pub fn modfd(&self, ev: i32) {
        if self.fd < 0 {
            return;
        }
        if let Err(e) = self.epoll.modify(self.fd, self.slot as u64, self.interests(ev)) {
            tracing::debug!(slot = self.slot, fd = self.fd, error = %e, "failed to re-arm connection");
        }
    }

    /// Unregister and close the socket. Safe to call more than once.
    pub fn close_conn(&mut self) -> bool {
        if self.fd < 0 {
            return false;
        }
        let _ = self.epoll.delete(self.fd);
        syscalls::close_fd(self.fd);
        tracing::debug!(slot = self.slot, fd = self.fd, peer = ?self.peer, "connection closed");
        self.fd = -1;
        self.unmap();
        true
    }

    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Pull available bytes into the read buffer. `false` means the peer
    /// closed, the socket failed, or the buffer was already full.
    pub fn read_once(&mut self) -> bool {
        if self.fd < 0 || self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }

        if !self.settings.trigger.is_edge() {
            return match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(Some(0)) | Err(_) => false,
                Ok(Some(n)) => {
                    self.read_idx += n;
                    true
                }
                // Spurious wakeup; the parser will ask for more.
                Ok(None) => true,
            };
        }

        // Edge-triggered: drain until the socket would block.
        while self.read_idx < READ_BUFFER_SIZE {
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(Some(0)) | Err(_) => return false,
                Ok(Some(n)) => self.read_idx += n,
                Ok(None) => break,
            }
        }
        true
    }

    fn line(&self, start: usize, end: usize) -> &[u8] {
        &self.read_buf[start..end]
    }

    /// Run the parser over what has been received so far and, once the
    /// request is complete, resolve it.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            if self.check_state == CheckState::Content {
                return self.parse_content();
            }

            match parser::parse_line(&mut self.read_buf, &mut self.checked_idx, self.read_idx) {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            }
            let (start, end) = (self.start_line, self.checked_idx - 2);
            self.start_line = self.checked_idx;

            match self.check_state {
                CheckState::RequestLine => {
                    let Some(line) = parser::parse_request_line(self.line(start, end)) else {
                        return HttpCode::BadRequest;
                    };
                    self.cgi = line.method == Method::Post;
                    self.method = line.method;
                    self.url = line.url;
                    self.check_state = CheckState::Headers;
                }
                CheckState::Headers => {
                    if start == end {
                        if self.content_length > 0 {
                            self.check_state = CheckState::Content;
                            continue;
                        }
                        return self.do_request();
                    }
                    match parser::parse_header(&self.read_buf[start..end]) {
                        Header::Connection(keep_alive) => self.keep_alive = keep_alive,
                        Header::ContentLength(Some(len)) => self.content_length = len,
                        Header::ContentLength(None) => return HttpCode::BadRequest,
                        Header::Host(host) => self.host = Some(host.to_string()),
                        Header::Unknown(line) => {
                            tracing::debug!(
                                slot = self.slot,
                                header = %String::from_utf8_lossy(line),
                                "ignoring unknown header"
                            );
                        }
                    }
                }
                CheckState::Content => unreachable!("content is handled before line parsing"),
            }
        }
    }

    fn parse_content(&mut self) -> HttpCode {
        let start = self.checked_idx;
        // The length is peer-controlled; compare against the room left
        // instead of adding to it.
        if self.content_length > READ_BUFFER_SIZE - start {
            return HttpCode::BadRequest;
        }
        let end = start + self.content_length;
        if self.read_idx < end {
            return HttpCode::NoRequest;
        }
        self.body = start..end;
        self.do_request()
    }

    /// The request body, once a request with content has been parsed.
    pub fn body(&self) -> &[u8] {
        &self.read_buf[self.body.clone()]
    }

    fn handle_action(&self, action: Action) -> &'static str {
        let credentials = router::parse_credentials(self.body());
        match action {
            Action::Register => {
                let Some((user, password)) = credentials else {
                    return router::REGISTER_FAILED;
                };
                match self.store.insert(&user, &password) {
                    Ok(InsertOutcome::Inserted) => {
                        tracing::info!(user = %user, "registered user");
                        router::REGISTER_OK
                    }
                    Ok(InsertOutcome::AlreadyExists) => router::REGISTER_FAILED,
                    Err(e) => {
                        tracing::warn!(user = %user, error = %e, "registration failed");
                        router::REGISTER_FAILED
                    }
                }
            }
            Action::Login => match credentials {
                Some((user, password))
                    if self.store.lookup(&user).as_deref() == Some(password.as_str()) =>
                {
                    router::LOGIN_OK
                }
                _ => router::LOGIN_FAILED,
            },
        }
    }

    /// Map the parsed target onto a file under the document root.
    pub fn do_request(&mut self) -> HttpCode {
        let settings = Arc::clone(&self.settings);
        let target = match settings.routes.resolve(&self.url, self.cgi) {
            Route::Page(page) => page,
            Route::Action(action) => self.handle_action(action),
            Route::Static => self.url.as_str(),
        };
        let target = target.split('?').next().unwrap_or_default();

        let relative = Path::new(target.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return HttpCode::ForbiddenRequest;
        }
        self.real_file = settings.doc_root.join(relative);

        let meta = match std::fs::metadata(&self.real_file) {
            Ok(meta) => meta,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & (libc::S_IROTH as u32) == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        let len = meta.len() as usize;
        if len == 0 {
            self.file = None;
            return HttpCode::FileRequest;
        }
        match MappedFile::open(&self.real_file, len) {
            Ok(map) => {
                self.file = Some(map);
                HttpCode::FileRequest
            }
            Err(e) => {
                tracing::warn!(path = %self.real_file.display(), error = %e, "cannot map file");
                HttpCode::InternalError
            }
        }
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let text = fmt::format(args);
        let end = self.write_idx + text.len();
        if end > WRITE_BUFFER_SIZE {
            return false;
        }
        self.write_buf[self.write_idx..end].copy_from_slice(text.as_bytes());
        self.write_idx = end;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!(
            "Content-Length: {}\r\nConnection: {}\r\n\r\n",
            content_len, connection
        ))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    /// Assemble the response for `code`. `false` if it does not fit.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        self.write_idx = 0;
        self.bytes_have_send = 0;

        if code == HttpCode::FileRequest {
            if !self.add_status_line(200, http::OK_200_TITLE) {
                return false;
            }
            let file_len = self.file.as_ref().map_or(0, MappedFile::len);
            if file_len > 0 {
                if !self.add_headers(file_len) {
                    return false;
                }
                self.bytes_to_send = self.write_idx + file_len;
                return true;
            }
            if !(self.add_headers(http::EMPTY_DOCUMENT.len())
                && self.add_content(http::EMPTY_DOCUMENT))
            {
                return false;
            }
            self.bytes_to_send = self.write_idx;
            return true;
        }

        let Some((status, title, form)) = code.error_page() else {
            return false;
        };
        if code == HttpCode::InternalError {
            self.keep_alive = false;
        }
        if !(self.add_status_line(status, title)
            && self.add_headers(form.len())
            && self.add_content(form))
        {
            return false;
        }
        self.bytes_to_send = self.write_idx;
        true
    }

    fn pending(&self) -> (&[u8], &[u8]) {
        let sent = self.bytes_have_send;
        let head = &self.write_buf[sent.min(self.write_idx)..self.write_idx];
        let file_sent = sent.saturating_sub(self.write_idx);
        let tail = match &self.file {
            Some(map) => &map.as_slice()[file_sent.min(map.len())..],
            None => &[][..],
        };
        (head, tail)
    }

    /// Send as much of the response as the socket takes. `true` keeps the
    /// connection (either more to send later or reset for the next request),
    /// `false` means close it.
    pub fn write(&mut self) -> bool {
        if self.fd < 0 {
            return false;
        }
        if self.bytes_to_send == 0 {
            self.modfd(EPOLLIN);
            self.reset();
            return true;
        }

        loop {
            let sent = {
                let (head, tail) = self.pending();
                syscalls::writev_nonblocking(self.fd, &[head, tail])
            };
            match sent {
                Ok(None) => {
                    self.modfd(EPOLLOUT);
                    return true;
                }
                Ok(Some(0)) | Err(_) => {
                    self.unmap();
                    return false;
                }
                Ok(Some(n)) => {
                    self.bytes_have_send += n;
                    if self.bytes_have_send >= self.bytes_to_send {
                        self.unmap();
                        self.modfd(EPOLLIN);
                        if self.keep_alive {
                            self.reset();
                            return true;
                        }
                        return false;
                    }
                }
            }
        }
    }

    /// Parse what is buffered and, if a request is complete, stage the
    /// response and ask for write readiness.
    pub fn process(&mut self) {
        let code = self.process_read();
        if code == HttpCode::NoRequest {
            self.modfd(EPOLLIN);
            return;
        }
        if !self.process_write(code) {
            tracing::warn!(slot = self.slot, ?code, "response did not fit the write buffer");
            self.close_conn();
            return;
        }
        self.modfd(EPOLLOUT);
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close_conn();
    }
}
