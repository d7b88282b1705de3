//! The parsed request delivered to handlers.

use crate::http::form::{parse_form, Form};
use crate::http::header::{self, Header};

/// The request methods the server recognizes. Anything else parses to
/// `Unknown`, which the request parser treats as a malformed request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Unknown,
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    /// Parses a method token, case-insensitively.
    pub fn from_token(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// One parsed HTTP request.
///
/// Handlers receive a shared reference: headers and body are immutable for
/// the handler's lifetime.
#[derive(Debug, Default, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) version: String,
    pub(crate) header: Header,
    pub(crate) body: Vec<u8>,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target, query suffix included verbatim.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI up to the query separator.
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri,
        }
    }

    /// The query suffix after the last `?`, or empty.
    pub fn query(&self) -> &str {
        match self.uri.rfind('?') {
            Some(pos) => &self.uri[pos + 1..],
            None => "",
        }
    }

    /// The HTTP version, e.g. `"1.1"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the client asked to keep the connection open: a
    /// case-sensitive `Connection: keep-alive` on an HTTP/1.1 request.
    pub fn is_keepalive(&self) -> bool {
        self.header.get(header::CONNECTION) == Some("keep-alive") && self.version == "1.1"
    }

    /// Decodes an url-encoded form: the body for POST, the query string
    /// for GET. Returns an empty form unless the request declares
    /// `application/x-www-form-urlencoded`.
    pub fn form(&self) -> Form {
        if self.header.get(header::CONTENT_TYPE) != Some("application/x-www-form-urlencoded") {
            return Form::new();
        }
        match self.method {
            Method::Post => match std::str::from_utf8(&self.body) {
                Ok(text) if !text.is_empty() => parse_form(text),
                _ => Form::new(),
            },
            Method::Get => parse_form(self.query()),
            _ => Form::new(),
        }
    }
}
