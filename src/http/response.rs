//! The response head: status codes, reason phrases, and status-line
//! serialization. The response body lives in the
//! [`ResponseWriter`](crate::http::ResponseWriter)'s segmented buffer.

use crate::http::header::Header;

/// The status codes the server knows how to name.
///
/// <https://developer.mozilla.org/en-US/docs/Web/HTTP/Status>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    // Informational responses
    Continue = 100,
    SwitchingProtocols = 101,
    Processing = 102, // WebDAV
    EarlyHints = 103,
    // Successful responses
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NonAuthoritativeInformation = 203,
    NoContent = 204,
    ResetContent = 205,
    PartialContent = 206,
    MultiStatus = 207,     // WebDAV
    AlreadyReported = 208, // WebDAV
    ImUsed = 226,          // HTTP Delta encoding
    // Redirection messages
    MultipleChoices = 300,
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    UseProxy = 305,
    TemporaryRedirect = 307,
    PermanentRedirect = 308,
    // Client error responses
    BadRequest = 400,
    Unauthorized = 401,
    PaymentRequired = 402,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    NotAcceptable = 406,
    ProxyAuthenticationRequired = 407,
    RequestTimeout = 408,
    Conflict = 409,
    Gone = 410,
    LengthRequired = 411,
    PreconditionFailed = 412,
    RequestEntityTooLarge = 413,
    UriTooLong = 414,
    UnsupportedMediaType = 415,
    RequestedRangeNotSatisfiable = 416,
    ExpectationFailed = 417,
    ImATeapot = 418,
    MisdirectedRequest = 421,
    UnprocessableEntity = 422, // WebDAV
    Locked = 423,              // WebDAV
    FailedDependency = 424,    // WebDAV
    TooEarly = 425,
    UpgradeRequired = 426,
    PreconditionRequired = 428,
    TooManyRequests = 429,
    RequestHeaderFieldsTooLarge = 431,
    UnavailableForLegalReasons = 451,
    // Server error responses
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    VersionNotSupported = 505,
    VariantAlsoNegotiates = 506,
    InsufficientStorage = 507, // WebDAV
    LoopDetected = 508,        // WebDAV
    NotExtended = 510,
    NetworkAuthenticationRequired = 511,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Maps a numeric status back into the table.
    pub fn from_u16(code: u16) -> Option<StatusCode> {
        use StatusCode::*;
        Some(match code {
            100 => Continue,
            101 => SwitchingProtocols,
            102 => Processing,
            103 => EarlyHints,
            200 => Ok,
            201 => Created,
            202 => Accepted,
            203 => NonAuthoritativeInformation,
            204 => NoContent,
            205 => ResetContent,
            206 => PartialContent,
            207 => MultiStatus,
            208 => AlreadyReported,
            226 => ImUsed,
            300 => MultipleChoices,
            301 => MovedPermanently,
            302 => Found,
            303 => SeeOther,
            304 => NotModified,
            305 => UseProxy,
            307 => TemporaryRedirect,
            308 => PermanentRedirect,
            400 => BadRequest,
            401 => Unauthorized,
            402 => PaymentRequired,
            403 => Forbidden,
            404 => NotFound,
            405 => MethodNotAllowed,
            406 => NotAcceptable,
            407 => ProxyAuthenticationRequired,
            408 => RequestTimeout,
            409 => Conflict,
            410 => Gone,
            411 => LengthRequired,
            412 => PreconditionFailed,
            413 => RequestEntityTooLarge,
            414 => UriTooLong,
            415 => UnsupportedMediaType,
            416 => RequestedRangeNotSatisfiable,
            417 => ExpectationFailed,
            418 => ImATeapot,
            421 => MisdirectedRequest,
            422 => UnprocessableEntity,
            423 => Locked,
            424 => FailedDependency,
            425 => TooEarly,
            426 => UpgradeRequired,
            428 => PreconditionRequired,
            429 => TooManyRequests,
            431 => RequestHeaderFieldsTooLarge,
            451 => UnavailableForLegalReasons,
            500 => InternalServerError,
            501 => NotImplemented,
            502 => BadGateway,
            503 => ServiceUnavailable,
            504 => GatewayTimeout,
            505 => VersionNotSupported,
            506 => VariantAlsoNegotiates,
            507 => InsufficientStorage,
            508 => LoopDetected,
            510 => NotExtended,
            511 => NetworkAuthenticationRequired,
            _ => return None,
        })
    }

    /// The canonical reason phrase.
    pub fn reason(self) -> &'static str {
        use StatusCode::*;
        match self {
            Continue => "Continue",
            SwitchingProtocols => "Switching Protocols",
            Processing => "Processing",
            EarlyHints => "Early Hints",
            Ok => "OK",
            Created => "Created",
            Accepted => "Accepted",
            NonAuthoritativeInformation => "Non-Authoritative Information",
            NoContent => "No Content",
            ResetContent => "Reset Content",
            PartialContent => "Partial Content",
            MultiStatus => "Multi-Status",
            AlreadyReported => "Already Reported",
            ImUsed => "IM Used",
            MultipleChoices => "Multiple Choices",
            MovedPermanently => "Moved Permanently",
            Found => "Found",
            SeeOther => "See Other",
            NotModified => "Not Modified",
            UseProxy => "Use Proxy",
            TemporaryRedirect => "Temporary Redirect",
            PermanentRedirect => "Permanent Redirect",
            BadRequest => "Bad Request",
            Unauthorized => "Unauthorized",
            PaymentRequired => "Payment Required",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            MethodNotAllowed => "Method Not Allowed",
            NotAcceptable => "Not Acceptable",
            ProxyAuthenticationRequired => "Proxy Authentication Required",
            RequestTimeout => "Request Timeout",
            Conflict => "Conflict",
            Gone => "Gone",
            LengthRequired => "Length Required",
            PreconditionFailed => "Precondition Failed",
            RequestEntityTooLarge => "Payload Too Large",
            UriTooLong => "URI Too Long",
            UnsupportedMediaType => "Unsupported Media Type",
            RequestedRangeNotSatisfiable => "Range Not Satisfiable",
            ExpectationFailed => "Expectation Failed",
            ImATeapot => "I'm a teapot",
            MisdirectedRequest => "Misdirected Request",
            UnprocessableEntity => "Unprocessable Entity",
            Locked => "Locked",
            FailedDependency => "Failed Dependency",
            TooEarly => "Too Early",
            UpgradeRequired => "Upgrade Required",
            PreconditionRequired => "Precondition Required",
            TooManyRequests => "Too Many Requests",
            RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            UnavailableForLegalReasons => "Unavailable For Legal Reasons",
            InternalServerError => "Internal Server Error",
            NotImplemented => "Not Implemented",
            BadGateway => "Bad Gateway",
            ServiceUnavailable => "Service Unavailable",
            GatewayTimeout => "Gateway Timeout",
            VersionNotSupported => "HTTP Version Not Supported",
            VariantAlsoNegotiates => "Variant Also Negotiates",
            InsufficientStorage => "Insufficient Storage",
            LoopDetected => "Loop Detected",
            NotExtended => "Not Extended",
            NetworkAuthenticationRequired => "Network Authentication Required",
        }
    }
}

/// The response head a handler fills in. `status` is a raw integer with
/// `0` meaning "unset"; values outside the table are coerced to
/// `400 Bad Request` at emission time.
#[derive(Debug, Default, Clone)]
pub struct Response {
    version: String,
    status: u16,
    desc: String,
    header: Header,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// The HTTP version, e.g. `"1.1"`. Empty until set; emission falls
    /// back to `1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_owned();
    }

    /// The raw status value; `0` while unset.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// The reason phrase override; empty means "use the table".
    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn set_desc(&mut self, desc: &str) {
        self.desc = desc.to_owned();
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// The status and reason that will actually be emitted: unknown or
    /// unset statuses are coerced to `400 Bad Request`.
    pub fn effective_status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::BadRequest)
    }

    /// The status line, CRLF included:
    /// `HTTP/VERSION SP STATUS SP REASON CRLF`.
    pub fn status_line(&self) -> String {
        let status = self.effective_status();
        let version = if self.version.is_empty() {
            "1.1"
        } else {
            &self.version
        };
        let reason = if self.desc.is_empty() {
            status.reason()
        } else {
            &self.desc
        };
        format!("HTTP/{version} {} {reason}\r\n", status.as_u16())
    }

    pub fn clear(&mut self) {
        self.version.clear();
        self.status = 0;
        self.desc.clear();
        self.header.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Splits a serialized status line back into its triple.
    fn parse_status_line(line: &str) -> (String, u16, String) {
        let line = line.strip_suffix("\r\n").expect("CRLF-terminated");
        let version = line
            .strip_prefix("HTTP/")
            .expect("HTTP/ prefix")
            .split(' ')
            .next()
            .unwrap()
            .to_owned();
        let mut rest = line.splitn(3, ' ');
        rest.next();
        let status: u16 = rest.next().unwrap().parse().unwrap();
        let reason = rest.next().unwrap_or("").to_owned();
        (version, status, reason)
    }

    /// Tests the mandatory reason phrases.
    #[test]
    fn test_reason_table() {
        assert_eq!(StatusCode::Ok.reason(), "OK");
        assert_eq!(StatusCode::BadRequest.reason(), "Bad Request");
        assert_eq!(StatusCode::Forbidden.reason(), "Forbidden");
        assert_eq!(StatusCode::NotFound.reason(), "Not Found");
    }

    /// Tests numeric round-trips through the table boundaries.
    #[test]
    fn test_from_u16() {
        assert_eq!(StatusCode::from_u16(100), Some(StatusCode::Continue));
        assert_eq!(
            StatusCode::from_u16(511),
            Some(StatusCode::NetworkAuthenticationRequired)
        );
        assert_eq!(StatusCode::from_u16(0), None);
        assert_eq!(StatusCode::from_u16(306), None);
        assert_eq!(StatusCode::from_u16(600), None);
        for code in [200u16, 404, 503] {
            assert_eq!(StatusCode::from_u16(code).unwrap().as_u16(), code);
        }
    }

    /// Tests that the emitted status line parses back to the same triple.
    #[test]
    fn test_status_line_round_trip() {
        let mut resp = Response::new();
        resp.set_version("1.1");
        resp.set_status(200);
        assert_eq!(resp.status_line(), "HTTP/1.1 200 OK\r\n");
        let (version, status, reason) = parse_status_line(&resp.status_line());
        assert_eq!(version, "1.1");
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");
    }

    /// Tests coercion of unset and unknown statuses to 400.
    #[test]
    fn test_unknown_status_coerced() {
        let resp = Response::new();
        assert_eq!(resp.status(), 0);
        assert_eq!(resp.status_line(), "HTTP/1.1 400 Bad Request\r\n");

        let mut resp = Response::new();
        resp.set_status(999);
        assert_eq!(resp.effective_status(), StatusCode::BadRequest);
    }

    /// Tests that an explicit reason phrase wins over the table.
    #[test]
    fn test_custom_reason() {
        let mut resp = Response::new();
        resp.set_status(404);
        resp.set_desc("Gone Fishing");
        assert_eq!(resp.status_line(), "HTTP/1.1 404 Gone Fishing\r\n");
    }
}
