//! # Erebus
//!
//! A small HTTP/1.1 server framework built on a single-reactor,
//! worker-pool architecture over edge-triggered epoll readiness.
//!
//! ## Features
//! - Nonblocking accept/read/write driven by one reactor thread
//! - One-shot fd re-arming, which serializes all work per connection
//! - Incremental request parsing that survives any byte-boundary split
//! - Segmented response buffers with zero-copy foreign regions (mmap,
//!   static literals) drained by gathered writes
//! - Exact and longest-prefix request routing
//! - Keyed timer driving per-connection idle expiry
//! - INI configuration and an asynchronous log sink
//!
//! ## Example
//! ```no_run
//! use erebus::{Server, StatusCode};
//!
//! fn main() -> Result<(), erebus::ServerError> {
//!     let server = Server::new()?;
//!     server.handle("/", |resp, _req| {
//!         resp.set_status_code(StatusCode::Ok);
//!         resp.write_str("Hello World!");
//!     })?;
//!     server.listen(8080, "")?;
//!     server.start()
//! }
//! ```
//!
//! ## Architecture
//! The server composes several standalone pieces:
//!
//! - [`Server`]: owns the listen socket, the poller, the connection
//!   table, the registry, the worker pool, and the idle timer
//! - [`poller::Poller`]: thread-safe epoll wrapper with one-shot and
//!   edge/level delivery per fd
//! - [`executor::WorkerPool`]: fixed worker set over a FIFO queue
//! - [`timer::Timer`]: keyed scheduler with per-key update/cancel
//! - [`segbuf::BufferVec`]: segmented buffer behind response bodies
//! - [`http`]: request/response types and the incremental parser
//!
//! ## Configuration
//! Settings are read from an INI file (see [`ini::Ini`] and
//! [`config::ServerConfig`]); the shipped binary reads `./config.ini`.

pub use crate::config::ServerConfig;
pub use crate::error::{ConfigError, IniError, JobError, ParseError, ServerError};
pub use crate::http::{Method, Request, ResponseWriter, StatusCode};
pub use crate::server::Server;

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod http;
pub mod ini;
pub mod keyed_heap;
pub mod logger;
pub mod net;
pub mod pool;
pub mod poller;
pub mod registry;
pub mod segbuf;
pub mod server;
pub mod timer;
