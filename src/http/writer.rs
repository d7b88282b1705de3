//! The response writer handed to handlers.
//!
//! Couples the response head with a segmented body buffer, so handlers
//! can mix copied bytes, static literals, and foreign regions (memory
//! maps) without the framework ever flattening them.

use crate::http::header::Header;
use crate::http::response::{Response, StatusCode};
use crate::segbuf::{BufferVec, ReleaseFn};

/// Builds one response: status, headers, body.
///
/// # Examples
///
/// ```
/// use erebus::http::{ResponseWriter, StatusCode};
///
/// fn handle(resp: &mut ResponseWriter) {
///     resp.set_status_code(StatusCode::Ok);
///     resp.header_mut().set("Content-Type", "text/plain");
///     resp.write_str("hello");
/// }
/// ```
#[derive(Default)]
pub struct ResponseWriter {
    resp: Response,
    buf: BufferVec,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> &str {
        self.resp.version()
    }

    pub fn set_version(&mut self, version: &str) {
        self.resp.set_version(version);
    }

    pub fn status(&self) -> u16 {
        self.resp.status()
    }

    /// Sets the raw status value; values outside the table are emitted as
    /// `400 Bad Request`.
    pub fn set_status(&mut self, status: u16) {
        self.resp.set_status(status);
    }

    pub fn set_status_code(&mut self, status: StatusCode) {
        self.resp.set_status(status.as_u16());
    }

    pub fn desc(&self) -> &str {
        self.resp.desc()
    }

    pub fn set_desc(&mut self, desc: &str) {
        self.resp.set_desc(desc);
    }

    pub fn header(&self) -> &Header {
        self.resp.header()
    }

    pub fn header_mut(&mut self) -> &mut Header {
        self.resp.header_mut()
    }

    /// Appends bytes to the response body.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.write(data);
    }

    /// Appends a string to the response body.
    pub fn write_str(&mut self, data: &str) {
        self.buf.write_str(data);
    }

    /// Appends a `'static` region to the body without copying.
    pub fn write_static(&mut self, data: &'static [u8]) {
        self.buf.write_static(data);
    }

    /// Appends an externally owned region to the body without copying;
    /// `release` runs exactly once after the bytes have been sent (or the
    /// response is dropped).
    ///
    /// # Safety
    /// Same contract as [`BufferVec::push_foreign`]: the region must stay
    /// valid and transferable across threads until `release` runs.
    pub unsafe fn write_foreign(&mut self, ptr: *mut u8, len: usize, release: ReleaseFn) {
        self.buf.push_foreign(ptr, len, release);
    }

    /// Bytes currently in the body.
    pub fn body_size(&self) -> usize {
        self.buf.readable_size()
    }

    /// Resets head and body for the next request on the connection.
    pub fn clear(&mut self) {
        self.resp.clear();
        self.buf.clear();
    }

    pub(crate) fn response(&self) -> &Response {
        &self.resp
    }

    pub(crate) fn body_mut(&mut self) -> &mut BufferVec {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests head setters and body accounting.
    #[test]
    fn test_build_response() {
        let mut w = ResponseWriter::new();
        w.set_version("1.1");
        w.set_status_code(StatusCode::Ok);
        w.header_mut().set("Content-Type", "text/plain");
        w.write_str("hel");
        w.write(b"lo");
        assert_eq!(w.status(), 200);
        assert_eq!(w.body_size(), 5);
        assert_eq!(w.header().get("Content-Type"), Some("text/plain"));
    }

    /// Tests that clear makes the writer reusable.
    #[test]
    fn test_clear() {
        let mut w = ResponseWriter::new();
        w.set_status(200);
        w.write_str("body");
        w.clear();
        assert_eq!(w.status(), 0);
        assert_eq!(w.body_size(), 0);
        assert!(w.header().is_empty());
    }
}
