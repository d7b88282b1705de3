//! The incremental HTTP/1.1 request parser.
//!
//! Bytes are pulled from a nonblocking source into a flat staging buffer,
//! then an explicit state machine consumes them line by line. Parsing can
//! stop at any byte boundary and resume on the next readiness event. A
//! request is yielded exactly once, at the transition to completion, and
//! the parser immediately re-enters its initial state; bytes left in the
//! staging buffer begin the next pipelined request.

use std::io::{self, Read};

use crate::buffer::Buffer;
use crate::error::{ParseError, ParseResult};
use crate::http::header;
use crate::http::request::{Method, Request};

/// Bytes of writable headroom guaranteed before each socket read.
const READ_RESERVE: usize = 5 * 1024;

/// The parser's progress states. Error terminals are expressed as
/// [`ParseError`] results instead of states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    /// About to start a fresh request.
    Init,
    /// Waiting for the full request line.
    RequestLine,
    /// Consuming header lines up to the empty line.
    Header,
    /// Headers done; about to validate `Content-Length`.
    BeforeBody,
    /// Copying body bytes.
    Body,
    /// A request was just yielded.
    Complete,
}

/// An incremental request parser bound to one connection.
#[derive(Debug)]
pub struct RequestParser {
    buf: Buffer,
    phase: ParsePhase,
    req: Option<Request>,
    /// Expected body length from `Content-Length`.
    body_len: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Buffer::new(),
            phase: ParsePhase::Init,
            req: None,
            body_len: 0,
        }
    }

    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    /// Bytes buffered but not yet consumed by the state machine.
    pub fn buffered(&self) -> usize {
        self.buf.readable_size()
    }

    /// Drops all state, buffered input included. For reusing the parser on
    /// a fresh connection; between pipelined requests the parser resets
    /// itself and keeps the surplus input.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.phase = ParsePhase::Init;
        self.req = None;
        self.body_len = 0;
    }

    /// Drains `src` into the staging buffer and advances the state
    /// machine.
    ///
    /// When `edge_triggered`, the source is read until `WouldBlock` or
    /// end-of-file, as edge notification demands; otherwise a single read
    /// suffices. Returns `Ok(Some(request))` exactly once per request,
    /// `Ok(None)` while more input is needed.
    pub fn consume_from<R: Read>(
        &mut self,
        src: &mut R,
        edge_triggered: bool,
    ) -> ParseResult<Option<Request>> {
        let mut saw_eof = false;
        loop {
            self.buf.ensure_writable(READ_RESERVE);
            match src.read(self.buf.spare_mut()) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => {
                    self.buf.advance_write(n);
                    if !edge_triggered {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ParseError::Read(e)),
            }
        }

        match self.process()? {
            Some(req) => Ok(Some(req)),
            None if saw_eof => Err(self.eof_error()),
            None => Ok(None),
        }
    }

    /// Feeds bytes directly, bypassing the socket. The state machine runs
    /// exactly as it would after a read.
    pub fn feed(&mut self, bytes: &[u8]) -> ParseResult<Option<Request>> {
        self.buf.write(bytes);
        self.process()
    }

    fn process(&mut self) -> ParseResult<Option<Request>> {
        loop {
            match self.phase {
                ParsePhase::Init => {
                    self.req = Some(Request::default());
                    self.body_len = 0;
                    self.phase = ParsePhase::RequestLine;
                }
                ParsePhase::RequestLine => {
                    let Some(line) = self.take_line() else {
                        return Ok(None);
                    };
                    let req = self.req.as_mut().expect("request allocated in Init");
                    parse_request_line(&line, req)?;
                    self.phase = ParsePhase::Header;
                }
                ParsePhase::Header => {
                    let Some(line) = self.take_line() else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.phase = ParsePhase::BeforeBody;
                        continue;
                    }
                    let req = self.req.as_mut().expect("request allocated in Init");
                    let (name, value) = parse_header_line(&line)?;
                    // Duplicate names keep their first value.
                    req.header.insert(name, value);
                }
                ParsePhase::BeforeBody => {
                    let req = self.req.as_ref().expect("request allocated in Init");
                    let length = req
                        .header
                        .get(header::CONTENT_LENGTH)
                        .and_then(|v| v.parse::<usize>().ok())
                        .ok_or(ParseError::BodyLength)?;
                    self.body_len = length;
                    self.phase = ParsePhase::Body;
                }
                ParsePhase::Body => {
                    let req = self.req.as_mut().expect("request allocated in Init");
                    let missing = self.body_len - req.body.len();
                    if missing > 0 {
                        let chunk = missing.min(self.buf.readable_size());
                        req.body.extend_from_slice(&self.buf.readable()[..chunk]);
                        self.buf.advance_read(chunk);
                    }
                    if req.body.len() < self.body_len {
                        return Ok(None);
                    }
                    self.phase = ParsePhase::Complete;
                }
                ParsePhase::Complete => {
                    let req = self.req.take().expect("request allocated in Init");
                    // Self-reset: surplus input starts the next request.
                    self.phase = ParsePhase::Init;
                    self.body_len = 0;
                    return Ok(Some(req));
                }
            }
        }
    }

    /// Pops one CRLF-terminated line off the staging buffer, without the
    /// terminator.
    fn take_line(&mut self) -> Option<String> {
        let readable = self.buf.readable();
        let pos = readable.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&readable[..pos]).into_owned();
        self.buf.advance_read(pos + 2);
        Some(line)
    }

    /// What an end-of-file mid-request means, by parse progress.
    fn eof_error(&self) -> ParseError {
        match self.phase {
            ParsePhase::Init | ParsePhase::RequestLine if self.buf.readable_empty() => {
                ParseError::Read(io::ErrorKind::UnexpectedEof.into())
            }
            ParsePhase::Init | ParsePhase::RequestLine => ParseError::RequestLine,
            ParsePhase::Header => ParseError::MissingBlankLine,
            ParsePhase::BeforeBody | ParsePhase::Body => ParseError::BodyLength,
            ParsePhase::Complete => ParseError::Read(io::ErrorKind::UnexpectedEof.into()),
        }
    }
}

/// Matches `METHOD SP URI SP "HTTP/" VERSION` with single spaces and no
/// trailing garbage. Unknown methods are a request-line error.
fn parse_request_line(line: &str, req: &mut Request) -> ParseResult<()> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let uri = parts.next().ok_or(ParseError::RequestLine)?;
    let proto = parts.next().ok_or(ParseError::RequestLine)?;
    let version = proto
        .strip_prefix("HTTP/")
        .ok_or(ParseError::RequestLine)?;
    if version.contains(' ') {
        return Err(ParseError::RequestLine);
    }
    req.method = Method::from_token(method);
    if req.method == Method::Unknown {
        return Err(ParseError::RequestLine);
    }
    req.uri = uri.to_owned();
    req.version = version.to_owned();
    Ok(())
}

/// Matches `NAME ":" [SP] VALUE`: the name runs to the first colon, and at
/// most one space after the colon is eaten.
fn parse_header_line(line: &str) -> ParseResult<(&str, &str)> {
    let (name, value) = line.split_once(':').ok_or(ParseError::Header)?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests a complete GET request in a single feed, and the consumed
    /// byte accounting.
    #[test]
    fn test_simple_get() {
        let mut parser = RequestParser::new();
        let input = b"GET /index?x=1 HTTP/1.1\r\nHost: example\r\nContent-Length: 0\r\n\r\n";
        let req = parser.feed(input).unwrap().expect("complete request");

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.uri(), "/index?x=1");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header().get("Host"), Some("example"));
        assert!(req.body().is_empty());
        assert_eq!(parser.phase(), ParsePhase::Init);
        // Everything consumed: request line + headers + CRLFs + body.
        assert_eq!(parser.buffered(), 0);
    }

    /// Tests byte-at-a-time delivery across every state boundary.
    #[test]
    fn test_incremental_feed() {
        let mut parser = RequestParser::new();
        let input = b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        for &byte in &input[..input.len() - 1] {
            assert!(parser.feed(&[byte]).unwrap().is_none());
        }
        let req = parser
            .feed(&input[input.len() - 1..])
            .unwrap()
            .expect("complete request");
        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.body(), b"abc");
    }

    /// Tests the malformed request line from the missing-version scenario.
    #[test]
    fn test_bad_request_line() {
        let mut parser = RequestParser::new();
        let err = parser.feed(b"GET /\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::RequestLine));
    }

    /// Tests that an unrecognized method is a request-line error.
    #[test]
    fn test_unknown_method() {
        let mut parser = RequestParser::new();
        let err = parser
            .feed(b"BREW /coffee HTTP/1.1\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::RequestLine));
    }

    /// Tests that extra spaces in the request line do not match.
    #[test]
    fn test_request_line_extra_space() {
        let mut parser = RequestParser::new();
        let err = parser
            .feed(b"GET / HTTP/1.1 junk\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::RequestLine));
    }

    /// Tests that a missing Content-Length is a body-length error, even
    /// for GET.
    #[test]
    fn test_missing_content_length() {
        let mut parser = RequestParser::new();
        let err = parser
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::BodyLength));
    }

    /// Tests a malformed header line.
    #[test]
    fn test_bad_header() {
        let mut parser = RequestParser::new();
        let err = parser
            .feed(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::Header));
    }

    /// Tests the duplicate-header policy: the first occurrence is kept.
    #[test]
    fn test_duplicate_header_first_wins() {
        let mut parser = RequestParser::new();
        let req = parser
            .feed(b"GET / HTTP/1.1\r\nX-Tag: first\r\nX-Tag: second\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .expect("complete request");
        assert_eq!(req.header().get("X-Tag"), Some("first"));
    }

    /// Tests that at most one space after the header colon is eaten.
    #[test]
    fn test_header_value_space() {
        let mut parser = RequestParser::new();
        let req = parser
            .feed(b"GET / HTTP/1.1\r\nA:no-space\r\nB:  two\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .expect("complete request");
        assert_eq!(req.header().get("A"), Some("no-space"));
        assert_eq!(req.header().get("B"), Some(" two"));
    }

    /// Tests pipelining: surplus bytes after one body start the next
    /// request, and the parser yields each request exactly once.
    #[test]
    fn test_pipelined_requests() {
        let mut parser = RequestParser::new();
        let two = b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcPOST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyz";

        let first = parser.feed(two).unwrap().expect("first request");
        assert_eq!(first.body(), b"abc");
        assert!(parser.buffered() > 0);

        // No new input needed; the surplus completes the second request.
        let second = parser.feed(b"").unwrap().expect("second request");
        assert_eq!(second.body(), b"xyz");
        assert_eq!(parser.buffered(), 0);
    }

    /// Tests a zero-length body with trailing pipelined bytes.
    #[test]
    fn test_zero_length_body() {
        let mut parser = RequestParser::new();
        let req = parser
            .feed(b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\nGET")
            .unwrap()
            .expect("complete request");
        assert!(req.body().is_empty());
        assert_eq!(parser.buffered(), 3);
    }

    /// Tests reading from an actual source with edge-triggered draining.
    #[test]
    fn test_consume_from_reader() {
        struct Chunked<'a> {
            chunks: Vec<&'a [u8]>,
        }
        impl Read for Chunked<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.chunks.pop() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(chunk);
                        Ok(chunk.len())
                    }
                    None => Err(io::ErrorKind::WouldBlock.into()),
                }
            }
        }

        let mut src = Chunked {
            chunks: vec![b"abc", b"GET / HTTP/1.1\r\nContent-Length: 3\r\n\r\n"],
        };
        let mut parser = RequestParser::new();
        let req = parser
            .consume_from(&mut src, true)
            .unwrap()
            .expect("complete request");
        assert_eq!(req.body(), b"abc");
    }

    /// Tests the EOF terminals: clean close, mid-headers, mid-body.
    #[test]
    fn test_eof_errors() {
        let mut eof = io::empty();

        let mut parser = RequestParser::new();
        let err = parser.consume_from(&mut eof, true).unwrap_err();
        assert!(matches!(err, ParseError::Read(_)));

        let mut parser = RequestParser::new();
        parser.feed(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap();
        let err = parser.consume_from(&mut eof, true).unwrap_err();
        assert!(matches!(err, ParseError::MissingBlankLine));

        let mut parser = RequestParser::new();
        parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab")
            .unwrap();
        let err = parser.consume_from(&mut eof, true).unwrap_err();
        assert!(matches!(err, ParseError::BodyLength));
    }

    /// Tests that clear drops buffered surplus for connection reuse.
    #[test]
    fn test_clear() {
        let mut parser = RequestParser::new();
        parser.feed(b"GET / HT").unwrap();
        parser.clear();
        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.phase(), ParsePhase::Init);
    }
}
