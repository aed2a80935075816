//! TCP listener against a real pool of fake engines.

mod common;

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use casbridge::log::NoOpLogger;
use casbridge::server::{self, TOO_LONG_REPLY};
use pretty_assertions::assert_eq;

use common::{start_pool, test_config, PATIENCE};

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    fn start(max_request: usize) -> Self {
        let pool = Arc::new(start_pool(test_config(2, Duration::from_secs(2))));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            server::serve(listener, pool, flag, max_request, Arc::new(NoOpLogger))
        });

        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(PATIENCE)).unwrap();
        stream
    }

    fn request(&self, payload: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(payload).unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        reply
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

#[test]
fn test_round_trip() {
    let server = TestServer::start(1024);
    assert_eq!(server.request(b"12+12;\n"), "24");
}

#[test]
fn test_error_replies_use_sentinels() {
    let server = TestServer::start(1024);
    assert_eq!(server.request(b";\n"), ";ERR;NO_OUTPUT");
    assert_eq!(server.request(b"12+12\n"), ";ERR;TIMEOUT");
}

#[test]
fn test_request_split_across_writes() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();
    stream.write_all(b"(2+3)").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"*4;\n").unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "20");
}

#[test]
fn test_parallel_clients() {
    let server = Arc::new(TestServer::start(1024));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let server = server.clone();
            thread::spawn(move || {
                let reply = server.request(format!("{}+{};\n", i, i).as_bytes());
                assert_eq!(reply, (i * 2).to_string());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_abandoned_request_gets_no_reply() {
    let server = TestServer::start(1024);
    let mut stream = server.connect();
    stream.write_all(b"1+1;").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "");

    // The listener keeps serving.
    assert_eq!(server.request(b"1+1;\n"), "2");
}

#[test]
fn test_oversized_request_is_rejected() {
    let server = TestServer::start(16);
    let mut stream = server.connect();
    // Without a newline the request can only end by hitting the limit.
    stream.write_all(&[b'1'; 64]).unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, TOO_LONG_REPLY);
}
