#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln::{CredentialStore, MemoryStore, Server, ServerConfig};

pub const JUDGE: &str = "<!DOCTYPE html><html><body><a href=\"0\">register</a><a href=\"1\">log in</a></body></html>\n";

const PAGES: &[(&str, &str)] = &[
    ("judge.html", JUDGE),
    ("register.html", "<html>register form</html>"),
    ("log.html", "<html>login form</html>"),
    ("registerError.html", "<html>register failed</html>"),
    ("welcome.html", "<html>welcome</html>"),
    ("logError.html", "<html>login failed</html>"),
    ("picture.html", "<html>pictures</html>"),
];

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    _root: tempfile::TempDir,
}

/// Start a server on an ephemeral port. Signal forwarding is process-wide,
/// so each test binary runs exactly one of these.
pub fn start(mut config: ServerConfig) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    for (name, body) in PAGES {
        let path = root.path().join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.doc_root = root.path().to_path_buf();
    config.timeslot_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let mut server = Server::bind(config, store.clone()).unwrap();
    let addr = server.local_addr();

    thread::spawn(move || {
        server.run().unwrap();
    });

    // Give server time to enter its loop
    thread::sleep(Duration::from_millis(50));
    TestServer {
        addr,
        store,
        _root: root,
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

fn read_some(stream: &mut TcpStream, buf: &mut [u8]) -> usize {
    loop {
        match stream.read(buf) {
            Ok(n) => return n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read failed: {}", e),
        }
    }
}

/// Read one response framed by its Content-Length. Returns the header block
/// and the body.
pub fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = read_some(stream, &mut buf);
        assert!(n > 0, "connection closed mid-response: {:?}", String::from_utf8_lossy(&raw));
        raw.extend_from_slice(&buf[..n]);

        let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&raw[..split]).into_owned();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .expect("Content-Length header")
            .trim()
            .parse()
            .unwrap();
        if raw.len() >= split + 4 + len {
            return (head, raw[split + 4..split + 4 + len].to_vec());
        }
    }
}

pub fn send(stream: &mut TcpStream, request: &[u8]) -> (String, Vec<u8>) {
    stream.write_all(request).unwrap();
    read_response(stream)
}

/// `true` once the server has closed its side.
pub fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

pub fn register_request(user: &str, password: &str) -> Vec<u8> {
    let body = format!("user={}&passwd={}", user, password);
    format!(
        "POST /3CGISQL.cgi HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

pub fn login_request(user: &str, password: &str) -> Vec<u8> {
    let body = format!("user={}&passwd={}", user, password);
    format!(
        "POST /2CGISQL.cgi HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

// ---- Scenarios shared by the dispatch models ----

pub fn landing_page_has_exact_length(server: &TestServer) {
    let mut stream = connect(server.addr);
    let (head, body) = send(
        &mut stream,
        b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
    assert!(head.contains(&format!("Content-Length: {}", JUDGE.len())));
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, JUDGE.as_bytes());

    // Same connection, next request.
    let (head, body) = send(&mut stream, b"GET /5 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"<html>pictures</html>");
}

pub fn missing_file_keeps_connection(server: &TestServer) {
    let mut stream = connect(server.addr);
    let (head, body) = send(&mut stream, b"GET /nonexistent HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "{}", head);
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, b"The requested file was not found on this server.\n");

    let (head, _) = send(&mut stream, b"GET /judge.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));
}

pub fn connection_close_is_honoured(server: &TestServer) {
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /judge.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK"));
    assert!(res.contains("Connection: close"));
    assert!(res.ends_with(JUDGE));
}

pub fn registration_is_idempotent(server: &TestServer, user: &str) {
    let mut stream = connect(server.addr);
    let (_, body) = send(&mut stream, &register_request(user, "secret"));
    assert_eq!(body, b"<html>login form</html>");
    assert_eq!(server.store.lookup(user).as_deref(), Some("secret"));

    let (_, body) = send(&mut stream, &register_request(user, "other"));
    assert_eq!(body, b"<html>register failed</html>");
    assert_eq!(server.store.lookup(user).as_deref(), Some("secret"));

    let (_, body) = send(&mut stream, &login_request(user, "secret"));
    assert_eq!(body, b"<html>welcome</html>");
    let (_, body) = send(&mut stream, &login_request(user, "wrong"));
    assert_eq!(body, b"<html>login failed</html>");
}

pub fn split_request_is_reassembled(server: &TestServer) {
    let mut stream = connect(server.addr);
    stream.write_all(b"GET /judge.html HTTP/1.1\r").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    let (head, body) = send(&mut stream, b"\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, JUDGE.as_bytes());
}

pub fn malformed_request_gets_400(server: &TestServer) {
    let mut stream = connect(server.addr);
    let (head, _) = send(&mut stream, b"BREW /pot HTTP/1.1\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "{}", head);
}

pub fn idle_connection_is_evicted(server: &TestServer) {
    let mut stream = connect(server.addr);
    // Idle timeout is three one-second slots.
    assert!(closed_by_server(&mut stream));
}

/// Several clients each push a stream of requests over one connection;
/// every response must arrive whole and in order.
pub fn back_to_back_requests_stay_intact(server: &TestServer) {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut stream = connect(addr);
                for i in 0..25 {
                    if i % 2 == 0 {
                        let (head, body) =
                            send(&mut stream, b"GET /judge.html HTTP/1.1\r\nHost: x\r\n\r\n");
                        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
                        assert_eq!(body, JUDGE.as_bytes());
                    } else {
                        let (head, _) =
                            send(&mut stream, b"GET /absent HTTP/1.1\r\nHost: x\r\n\r\n");
                        assert!(head.starts_with("HTTP/1.1 404"), "{}", head);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
