//! The handler registry: URI pattern to handler.
//!
//! Patterns are matched exactly first. Patterns ending in `/` also join a
//! prefix index kept sorted by descending length, so the longest
//! registered prefix of a URI wins. Registration happens before the
//! server starts; lookups afterwards are read-only.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ServerError, ServerResult};
use crate::http::{Request, ResponseWriter};

/// A request handler: populates the response writer from the request.
pub type Handler = Arc<dyn Fn(&mut ResponseWriter, &Request) + Send + Sync>;

/// Maps URI patterns to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    exact: HashMap<String, Handler>,
    /// Trailing-slash patterns, longest first.
    prefixes: Vec<(String, Handler)>,
    default: Option<Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `pattern`.
    ///
    /// A pattern ending in `/` additionally matches any URI it prefixes.
    /// Empty and duplicate patterns are rejected.
    pub fn handle(
        &mut self,
        pattern: &str,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) -> ServerResult<()> {
        if pattern.is_empty() {
            return Err(ServerError::EmptyPattern);
        }
        if self.exact.contains_key(pattern) {
            return Err(ServerError::DuplicatePattern(pattern.to_owned()));
        }
        let handler: Handler = Arc::new(handler);
        self.exact.insert(pattern.to_owned(), handler.clone());
        if pattern.ends_with('/') {
            // First entry no longer than this one keeps the list sorted by
            // descending length.
            let at = self
                .prefixes
                .partition_point(|(p, _)| p.len() > pattern.len());
            self.prefixes.insert(at, (pattern.to_owned(), handler));
        }
        Ok(())
    }

    /// Sets the handler used when no pattern matches.
    pub fn set_default(
        &mut self,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) {
        self.default = Some(Arc::new(handler));
    }

    /// Looks up the handler for a URI: exact match first, then the
    /// longest registered prefix.
    pub fn matches(&self, uri: &str) -> Option<Handler> {
        if let Some(handler) = self.exact.get(uri) {
            return Some(handler.clone());
        }
        self.prefixes
            .iter()
            .find(|(p, _)| uri.starts_with(p.as_str()))
            .map(|(_, h)| h.clone())
    }

    /// The fallback handler, when one was registered.
    pub fn default_handler(&self) -> Option<Handler> {
        self.default.clone()
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &'static str) -> impl Fn(&mut ResponseWriter, &Request) + Send + Sync {
        move |resp, _req| resp.set_desc(name)
    }

    fn run(handler: Option<Handler>) -> String {
        let handler = handler.expect("handler matched");
        let mut resp = ResponseWriter::new();
        handler(&mut resp, &Request::default());
        resp.desc().to_owned()
    }

    /// Tests that an exact pattern returns its own handler.
    #[test]
    fn test_exact_match() {
        let mut reg = HandlerRegistry::new();
        reg.handle("/hello", tag("hello")).unwrap();
        reg.handle("/hello/world", tag("world")).unwrap();
        assert_eq!(run(reg.matches("/hello")), "hello");
        assert_eq!(run(reg.matches("/hello/world")), "world");
        assert!(reg.matches("/other").is_none());
    }

    /// Tests longest-prefix routing across nested trailing-slash patterns.
    #[test]
    fn test_longest_prefix_wins() {
        let mut reg = HandlerRegistry::new();
        reg.handle("/api/", tag("api")).unwrap();
        reg.handle("/api/v1/", tag("v1")).unwrap();
        reg.handle("/", tag("root")).unwrap();

        assert_eq!(run(reg.matches("/api/v1/users")), "v1");
        assert_eq!(run(reg.matches("/api/users")), "api");
        assert_eq!(run(reg.matches("/anything")), "root");
        // Exact probe beats the prefix scan.
        assert_eq!(run(reg.matches("/api/")), "api");
    }

    /// Tests that a pattern without a trailing slash never prefix-matches.
    #[test]
    fn test_no_prefix_without_slash() {
        let mut reg = HandlerRegistry::new();
        reg.handle("/api", tag("api")).unwrap();
        assert!(reg.matches("/api/users").is_none());
    }

    /// Tests registration rejections.
    #[test]
    fn test_rejections() {
        let mut reg = HandlerRegistry::new();
        assert!(matches!(
            reg.handle("", tag("x")),
            Err(ServerError::EmptyPattern)
        ));
        reg.handle("/a", tag("x")).unwrap();
        assert!(matches!(
            reg.handle("/a", tag("y")),
            Err(ServerError::DuplicatePattern(_))
        ));
    }

    /// Tests the default-handler fallback.
    #[test]
    fn test_default_handler() {
        let mut reg = HandlerRegistry::new();
        assert!(reg.default_handler().is_none());
        reg.set_default(tag("fallback"));
        assert_eq!(run(reg.default_handler()), "fallback");
    }
}
