//! TCP front end: one newline-terminated request per connection.
//!
//! The accept loop runs on a non-blocking listener so the shutdown flag is
//! seen promptly. Every accepted connection gets its own thread, which
//! reads the request, submits it to the pool, blocks on the reply, writes
//! the wire text, and closes the connection.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::log::Logger;
use crate::pool::WorkerPool;
use crate::{log_debug, log_info, log_warn};

/// Reply for requests longer than the configured limit
pub const TOO_LONG_REPLY: &str = ";ERR;TOO_LONG";

/// Accept loop sleep when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Backoff after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A client that sends nothing for this long is dropped
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// What reading a request produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Complete request, terminator included
    Request(String),
    /// Peer closed or went idle before the terminator
    Abandoned,
    /// More than the allowed number of bytes without a terminator
    TooLong,
}

/// Serve connections until `shutdown` is set.
pub fn serve(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    shutdown: Arc<AtomicBool>,
    max_request: usize,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    if let Ok(addr) = listener.local_addr() {
        log_info!(logger, "listening on {}", addr);
    }

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log_debug!(logger, "connection from {}", peer);
                let pool = pool.clone();
                let conn_logger = logger.clone();
                let spawned = thread::Builder::new()
                    .name("client".to_string())
                    .spawn(move || {
                        if let Err(e) =
                            handle_connection(stream, &pool, max_request, conn_logger.as_ref())
                        {
                            log_warn!(conn_logger, "connection from {} failed: {}", peer, e);
                        }
                    });
                if let Err(e) = spawned {
                    log_warn!(logger, "failed to spawn connection thread: {}", e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log_warn!(logger, "error accepting connection: {}", e);
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }

    log_info!(logger, "listener stopped");
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    pool: &WorkerPool,
    max_request: usize,
    logger: &dyn Logger,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_IDLE_TIMEOUT))?;

    let reply = match read_request(&mut stream, max_request)? {
        Incoming::Request(text) => pool.submit(text).wait().to_wire().to_string(),
        Incoming::TooLong => {
            log_warn!(logger, "rejecting request longer than {} bytes", max_request);
            TOO_LONG_REPLY.to_string()
        }
        Incoming::Abandoned => {
            log_debug!(logger, "client left before completing its request");
            return Ok(());
        }
    };

    stream.write_all(reply.as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Read until a newline arrives, the peer goes away, or `max_request` bytes
/// have been read without one.
pub fn read_request(stream: &mut impl Read, max_request: usize) -> io::Result<Incoming> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(Incoming::Abandoned),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Ok(Incoming::Abandoned)
            }
            Err(e) => return Err(e),
        };
        request.extend_from_slice(&buf[..n]);

        if let Some(end) = request.iter().position(|&b| b == b'\n') {
            request.truncate(end + 1);
            return Ok(Incoming::Request(String::from_utf8_lossy(&request).into_owned()));
        }
        if request.len() > max_request {
            return Ok(Incoming::TooLong);
        }
    }
}
