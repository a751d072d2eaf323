//! Admission when every connection slot is taken.
mod common;

use std::io::Read;
use std::thread;
use std::time::Duration;

use kiln::ServerConfig;

#[test]
fn full_server_answers_busy_and_closes() {
    let config = ServerConfig {
        max_connections: 1,
        thread_num: 1,
        ..ServerConfig::default()
    };
    let server = common::start(config);

    let mut held = common::connect(server.addr);
    thread::sleep(Duration::from_millis(100));

    let mut rejected = common::connect(server.addr);
    let mut reply = Vec::new();
    rejected.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"Internal server busy");

    // The admitted connection is unaffected.
    let (head, body) = common::send(&mut held, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, common::JUDGE.as_bytes());

    // Once it is gone the slot is handed out again.
    drop(held);
    thread::sleep(Duration::from_millis(100));
    let mut next = common::connect(server.addr);
    let (head, _) = common::send(&mut next, b"GET /judge.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));
}
