//! Per-client connection state.
//!
//! A connection owns its nonblocking stream, the request parser, and the
//! response writer. Once a handler has populated the writer,
//! [`make_response`](Connection::make_response) freezes the wire bytes
//! (status line and headers serialized, body segments spliced in without
//! copying) and [`write_to_socket`](Connection::write_to_socket) drains
//! them with gathered writes across however many writability events it
//! takes.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::ParseResult;
use crate::http::header;
use crate::http::{Request, RequestParser, ResponseWriter};
use crate::segbuf::BufferVec;

/// The result of one gathered write attempt.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Bytes accepted by the kernel in this attempt.
    pub written: usize,
    /// The response is fully sent (or the connection is beyond saving).
    pub done: bool,
    /// Nothing could be written right now; re-arm for writability.
    pub retry: bool,
    /// The write failed with something other than `WouldBlock`.
    pub error: Option<io::Error>,
}

/// One accepted client connection.
pub struct Connection {
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: SocketAddr,
    keep_alive: bool,
    parser: RequestParser,
    writer: ResponseWriter,
    /// Frozen response bytes; the read cursor is the consumed offset.
    response: Option<BufferVec>,
}

impl Connection {
    /// Wraps an accepted stream. The caller has already made it
    /// nonblocking.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream: Some(stream),
            fd,
            peer,
            keep_alive: false,
            parser: RequestParser::new(),
            writer: ResponseWriter::new(),
            response: None,
        }
    }

    /// The client fd. Stays valid as a table key after `close()`.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the last parsed request asked for keep-alive.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Forces the connection to close after the pending response; used
    /// when a parse error makes further requests untrustworthy.
    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Drives the parser against the socket. On completion the keep-alive
    /// flag is captured from the request.
    pub fn parse_from_socket(&mut self, edge_triggered: bool) -> ParseResult<Option<Request>> {
        let Some(stream) = &self.stream else {
            return Ok(None);
        };
        let mut reader: &TcpStream = stream;
        let result = self.parser.consume_from(&mut reader, edge_triggered);
        if let Ok(Some(req)) = &result {
            self.keep_alive = req.is_keepalive();
        }
        result
    }

    /// The response writer for the in-flight request.
    pub fn writer(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    /// Serializes the status line and headers, splices in the body
    /// segments, and freezes the result for writing. A missing
    /// `Content-Length` header is filled in from the body size.
    pub fn make_response(&mut self) {
        if !self.writer.header().contains(header::CONTENT_LENGTH) {
            let size = self.writer.body_size().to_string();
            self.writer.header_mut().set(header::CONTENT_LENGTH, &size);
        }
        let mut full = BufferVec::new();
        full.write_str(&self.writer.response().status_line());
        full.write_str(&self.writer.response().header().to_string());
        full.write_str("\r\n");
        full.append(self.writer.body_mut());
        self.response = Some(full);
    }

    /// Whether a frozen response is waiting to be written.
    pub fn has_response(&self) -> bool {
        self.response
            .as_ref()
            .map(|buf| !buf.readable_empty())
            .unwrap_or(false)
    }

    /// Issues one gathered write of the remaining response bytes.
    pub fn write_to_socket(&mut self) -> WriteOutcome {
        let done = WriteOutcome {
            written: 0,
            done: true,
            retry: false,
            error: None,
        };
        let Some(stream) = &self.stream else {
            return done;
        };
        let Some(buf) = &mut self.response else {
            return done;
        };
        let views = buf.read_view();
        if views.is_empty() {
            return done;
        }
        let mut writer: &TcpStream = stream;
        match writer.write_vectored(&views) {
            Ok(n) => {
                buf.advance_read(n);
                WriteOutcome {
                    written: n,
                    done: buf.readable_empty(),
                    retry: false,
                    error: None,
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome {
                written: 0,
                done: false,
                retry: true,
                error: None,
            },
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => WriteOutcome {
                written: 0,
                done: false,
                retry: true,
                error: None,
            },
            Err(e) => WriteOutcome {
                written: 0,
                done: true,
                retry: false,
                error: Some(e),
            },
        }
    }

    /// Resets the writer and the frozen response for the next pipelined
    /// request. The parser keeps any surplus input it already buffered.
    pub fn clear(&mut self) {
        self.writer.clear();
        self.response = None;
    }

    /// Shuts both directions down without closing the fd, so the poller
    /// reports a hangup on the reactor thread.
    pub fn shutdown(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Closes the socket. Idempotent; returns `false` when already closed.
    pub fn close(&mut self) -> bool {
        self.stream.take().is_some()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        (Connection::new(stream, peer), client)
    }

    /// Tests the full cycle: request bytes in, response bytes out.
    #[test]
    fn test_request_response_cycle() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        client.flush().unwrap();

        let req = loop {
            if let Some(req) = conn.parse_from_socket(true).unwrap() {
                break req;
            }
        };
        assert_eq!(req.uri(), "/");
        assert!(!conn.is_keep_alive());

        conn.writer().set_version("1.1");
        conn.writer().set_status(200);
        conn.writer().write_str("hello");
        conn.make_response();
        assert!(conn.has_response());

        loop {
            let outcome = conn.write_to_socket();
            assert!(outcome.error.is_none());
            if outcome.done {
                break;
            }
        }
        conn.close();

        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    /// Tests keep-alive capture from the parsed request.
    #[test]
    fn test_keep_alive_capture() {
        let (mut conn, mut client) = pair();
        client
            .write_all(
                b"GET / HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();
        loop {
            if conn.parse_from_socket(true).unwrap().is_some() {
                break;
            }
        }
        assert!(conn.is_keep_alive());
    }

    /// Tests that an explicit Content-Length set by the handler is kept.
    #[test]
    fn test_explicit_content_length_kept() {
        let (mut conn, _client) = pair();
        conn.writer().set_status(200);
        conn.writer().header_mut().set(header::CONTENT_LENGTH, "99");
        conn.make_response();
        // The frozen bytes carry the handler's value, not the body size.
        assert!(conn.has_response());
    }

    /// Tests a zero-copy body region through the full write path: the
    /// bytes arrive in order between the head and the trailer, and the
    /// release function runs exactly once, after the send.
    #[test]
    fn test_foreign_body_region() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (mut conn, mut client) = pair();
        conn.writer().set_version("1.1");
        conn.writer().set_status(200);

        let releases = Arc::new(AtomicUsize::new(0));
        let payload = vec![b'x'; 1 << 16].into_boxed_slice();
        let len = payload.len();
        let ptr = Box::into_raw(payload) as *mut u8;
        let counter = releases.clone();
        unsafe {
            conn.writer().write_foreign(
                ptr,
                len,
                Box::new(move |p, n| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(p, n)));
                }),
            );
        }
        conn.writer().write_str("\r\n");
        conn.make_response();

        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            client.read_to_end(&mut out).unwrap();
            out
        });
        loop {
            let outcome = conn.write_to_socket();
            assert!(outcome.error.is_none());
            if outcome.done {
                break;
            }
            if outcome.retry {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        conn.clear();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        conn.close();

        let out = reader.join().unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(&format!("Content-Length: {}", len + 2)));
        assert!(text.ends_with("\r\n"));
        assert_eq!(out.len() - out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() - 4, len + 2);
    }

    /// Tests close idempotence.
    #[test]
    fn test_close_idempotent() {
        let (mut conn, _client) = pair();
        let fd = conn.fd();
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.fd(), fd);
    }

    /// Tests that clear resets the response but keeps the connection
    /// usable for the next request.
    #[test]
    fn test_clear_for_next_request() {
        let (mut conn, mut client) = pair();
        conn.writer().set_status(200);
        conn.make_response();
        conn.clear();
        assert!(!conn.has_response());

        client
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        let req = loop {
            if let Some(req) = conn.parse_from_socket(true).unwrap() {
                break req;
            }
        };
        assert_eq!(req.body(), b"ok");
    }
}
