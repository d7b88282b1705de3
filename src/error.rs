use std::io;
use thiserror::Error;

/// Errors produced while parsing an INI document.
///
/// Parsing never panics; every malformed line is reported as a value
/// carrying the error kind and the 1-based line number on which it
/// occurred.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at line {line}")]
pub struct IniError {
    pub kind: IniErrorKind,
    pub line: usize,
}

/// The kinds of malformed input the INI parser can encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IniErrorKind {
    /// A section header `[name` without the closing bracket.
    #[error("unclosed section header")]
    UnclosedSection,

    /// A section header `[]` with an empty name.
    #[error("empty section name")]
    EmptySectionName,

    /// A non-comment line outside any `key = value` shape.
    #[error("missing '=' delimiter")]
    MissingDelimiter,

    /// A `key = value` line before the first section header.
    #[error("key/value pair outside of a section")]
    OrphanKey,
}

/// Errors raised while loading or validating the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not parseable INI.
    #[error("cannot parse config file: {0}")]
    Ini(#[from] IniError),

    /// `server.port` is present but not a valid integer.
    #[error("invalid port value: {0:?}")]
    InvalidPort(String),

    /// `server.port` is below 1024; the server refuses privileged ports.
    #[error("port {0} is privileged (must be >= 1024)")]
    PrivilegedPort(u16),

    /// `server.address` is present but not an IPv4 literal.
    #[error("invalid address value: {0:?}")]
    InvalidAddress(String),

    /// A numeric key holds a value that does not parse.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Terminal states of the HTTP request parser.
///
/// Any of these ends the current request cycle; the connection path answers
/// with `400 Bad Request` where a response can still be framed, and closes
/// the connection otherwise.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The request line does not match `METHOD SP URI SP HTTP/VERSION`, or
    /// the method is not one the server knows.
    #[error("malformed request line")]
    RequestLine,

    /// A header line does not match `NAME ":" [SP] VALUE`.
    #[error("malformed header line")]
    Header,

    /// The header block was never terminated by an empty line.
    #[error("missing empty line after headers")]
    MissingBlankLine,

    /// `Content-Length` is absent or does not parse as a non-negative
    /// integer. Every request requires one; zero is acceptable.
    #[error("missing or invalid Content-Length")]
    BodyLength,

    /// Reading from the socket failed with something other than
    /// `WouldBlock` or `Interrupted`.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

/// Errors reported by a [`JobHandle`](crate::executor::JobHandle) when the
/// submitted job did not produce a value, and by the worker pool's own
/// plumbing.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job panicked; the panic was caught at the worker boundary.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The pool was torn down before the job ran.
    #[error("worker pool shut down before the job ran")]
    Disconnected,

    /// A lock guarding pool state was poisoned by a panicking thread.
    #[error("mutex lock poisoned")]
    LockPoisoned,
}

/// Errors raised by the server front end.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `listen` or `handle` was called while the event loop is running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `start` was called before a successful `listen`.
    #[error("server is not listening")]
    NotListening,

    /// The requested port is privileged.
    #[error("port {0} is privileged (must be >= 1024 or 0 for ephemeral)")]
    PrivilegedPort(u16),

    /// An empty handler pattern was supplied.
    #[error("handler pattern is empty")]
    EmptyPattern,

    /// The pattern is already registered.
    #[error("handler pattern {0:?} is already registered")]
    DuplicatePattern(String),

    /// A lock guarding shared server state was poisoned by a panicking
    /// thread.
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Socket setup or poller registration failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for parser outcomes.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Result alias for server front-end operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that INI errors render the kind together with the line number.
    #[test]
    fn test_ini_error_display() {
        let err = IniError {
            kind: IniErrorKind::MissingDelimiter,
            line: 7,
        };
        assert_eq!(err.to_string(), "missing '=' delimiter at line 7");
    }

    /// Tests the automatic conversion from io::Error to ServerError.
    #[test]
    fn test_server_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "test error");
        let err = ServerError::from(io_err);
        assert!(matches!(err, ServerError::Io(_)));
    }

    /// Tests that a read failure keeps its io::Error as the source.
    #[test]
    fn test_parse_error_source() {
        use std::error::Error as _;
        let err = ParseError::Read(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "read failed: gone");
    }
}
