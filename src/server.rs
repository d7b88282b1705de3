//! The server reactor.
//!
//! One thread owns the listen socket and the poller and blocks in
//! [`Poller::wait`]; per-connection read and write handling runs on the
//! worker pool. Client fds are registered one-shot, so after an event is
//! dispatched the fd stays silent until the handling task re-arms it;
//! that serializes all work per connection even though tasks land on
//! different workers. An eventfd registered alongside the sockets lets
//! [`Server::stop`] interrupt a blocked wait from any thread.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ParseError, ServerError, ServerResult};
use crate::executor::WorkerPool;
use crate::http::{Request, ResponseWriter, StatusCode};
use crate::net::{self, WakeFd};
use crate::poller::{Event, Interest, Poller};
use crate::registry::HandlerRegistry;
use crate::timer::Timer;

/// Poller token of the listen socket.
const LISTEN_TOKEN: u64 = u64::MAX;
/// Poller token of the shutdown eventfd.
const WAKE_TOKEN: u64 = u64::MAX - 1;

type ConnRef = Arc<Mutex<Connection>>;

struct Shared {
    poller: Poller,
    wake: WakeFd,
    connections: RwLock<HashMap<RawFd, ConnRef>>,
    registry: RwLock<HandlerRegistry>,
    pool: WorkerPool,
    timer: Timer<RawFd>,
    running: AtomicBool,
    listen_edge: AtomicBool,
    client_edge: AtomicBool,
    idle_timeout: Duration,
}

/// The HTTP server front end.
///
/// # Examples
///
/// ```no_run
/// use erebus::server::Server;
/// use erebus::http::StatusCode;
///
/// let server = Server::new().unwrap();
/// server
///     .handle("/", |resp, _req| {
///         resp.set_status_code(StatusCode::Ok);
///         resp.write_str("hello");
///     })
///     .unwrap();
/// server.listen(8080, "").unwrap();
/// server.start().unwrap();
/// ```
pub struct Server {
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a server with default configuration.
    pub fn new() -> ServerResult<Self> {
        Self::with_config(&ServerConfig::default())
    }

    /// Creates a server sized by the configuration: worker count and idle
    /// timeout come from it, the listen address and port are passed to
    /// [`listen`](Self::listen) separately.
    pub fn with_config(config: &ServerConfig) -> ServerResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                poller: Poller::new()?,
                wake: WakeFd::new()?,
                connections: RwLock::new(HashMap::new()),
                registry: RwLock::new(HandlerRegistry::new()),
                pool: WorkerPool::new(config.workers),
                timer: Timer::new(),
                running: AtomicBool::new(false),
                listen_edge: AtomicBool::new(true),
                client_edge: AtomicBool::new(true),
                idle_timeout: config.idle_timeout(),
            }),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Registers a handler. Registration is frozen once the event loop
    /// runs.
    pub fn handle(
        &self,
        pattern: &str,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) -> ServerResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyRunning);
        }
        self.shared
            .registry
            .write()
            .map_err(|_| ServerError::LockPoisoned)?
            .handle(pattern, handler)
    }

    /// Registers the fallback handler invoked when no pattern matches.
    pub fn handle_default(
        &self,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) -> ServerResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyRunning);
        }
        self.shared
            .registry
            .write()
            .map_err(|_| ServerError::LockPoisoned)?
            .set_default(handler);
        Ok(())
    }

    /// Chooses edge- or level-triggered delivery for the listen socket and
    /// for client sockets independently. Takes effect at `start`.
    pub fn set_trigger_mode(&self, listen_et: bool, client_et: bool) {
        self.shared.listen_edge.store(listen_et, Ordering::Release);
        self.shared.client_edge.store(client_et, Ordering::Release);
    }

    /// Binds the listen socket.
    ///
    /// `address` is an IPv4 literal; empty means every interface. Ports
    /// 1-1023 are refused; port 0 binds an ephemeral port (see
    /// [`local_addr`](Self::local_addr)). The backlog uses the configured
    /// default.
    pub fn listen(&self, port: u16, address: &str) -> ServerResult<()> {
        self.listen_with_backlog(port, address, ServerConfig::default().backlog)
    }

    /// [`listen`](Self::listen) with an explicit backlog.
    pub fn listen_with_backlog(&self, port: u16, address: &str, backlog: i32) -> ServerResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(ServerError::AlreadyRunning);
        }
        if port > 0 && port < 1024 {
            return Err(ServerError::PrivilegedPort(port));
        }
        let ip = if address.is_empty() {
            std::net::Ipv4Addr::UNSPECIFIED
        } else {
            address
                .parse()
                .map_err(|_| ServerError::Io(std::io::ErrorKind::InvalidInput.into()))?
        };
        let listener = net::listen_socket(SocketAddrV4::new(ip, port), backlog)?;
        let addr = listener.local_addr()?;
        *self
            .listener
            .lock()
            .map_err(|_| ServerError::LockPoisoned)? = Some(listener);
        *self
            .local_addr
            .lock()
            .map_err(|_| ServerError::LockPoisoned)? = Some(addr);
        log::info!("listening on {addr}");
        Ok(())
    }

    /// The bound address, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Number of tracked client connections.
    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .read()
            .map(|table| table.len())
            .unwrap_or(0)
    }

    /// Runs the event loop on the calling thread until [`stop`](Self::stop).
    ///
    /// On return the worker pool is drained, the timer is stopped, the
    /// listen socket is closed, and every tracked connection is closed.
    pub fn start(&self) -> ServerResult<()> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| ServerError::LockPoisoned)?
            .take()
            .ok_or(ServerError::NotListening)?;
        if self.shared.running.swap(true, Ordering::AcqRel) {
            // Put the listener back; someone else is driving the loop.
            if let Ok(mut slot) = self.listener.lock() {
                *slot = Some(listener);
            }
            return Err(ServerError::AlreadyRunning);
        }

        let shared = &self.shared;
        let mut listen_interest = Interest::READABLE | Interest::HANGUP;
        if shared.listen_edge.load(Ordering::Acquire) {
            listen_interest = listen_interest.edge();
        }
        shared
            .poller
            .add(listener.as_raw_fd(), listen_interest, LISTEN_TOKEN)?;
        shared.poller.add(shared.wake.fd(), Interest::READABLE, WAKE_TOKEN)?;
        shared.timer.start();

        let result = self.event_loop(&listener);
        shared.running.store(false, Ordering::Release);

        // Teardown, in dependency order: no new events, no queued work,
        // no timers, then the sockets.
        shared.pool.wait_idle();
        shared.timer.stop();
        shared.timer.clear();
        let drained: Vec<(RawFd, ConnRef)> = match shared.connections.write() {
            Ok(mut table) => table.drain().collect(),
            Err(e) => {
                log::error!("connection table poisoned at shutdown: {e}");
                Vec::new()
            }
        };
        for (fd, conn) in drained {
            let _ = shared.poller.delete(fd);
            // A poisoned entry still owns a live socket; close it anyway.
            conn.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close();
        }
        let _ = shared.poller.delete(shared.wake.fd());
        let _ = shared.poller.delete(listener.as_raw_fd());
        drop(listener);
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = None;
        }
        log::info!("server stopped");
        result
    }

    /// Asks the event loop to exit and wakes it. Returns `false` when the
    /// server is not running.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shared.wake.wake();
        true
    }

    fn event_loop(&self, listener: &TcpListener) -> ServerResult<()> {
        let shared = &self.shared;
        while shared.running.load(Ordering::Acquire) {
            let events = match shared.poller.wait(-1) {
                Ok(events) => events,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("poller wait failed: {e}");
                    return Err(ServerError::Io(e));
                }
            };
            for event in events {
                match event.token {
                    LISTEN_TOKEN => self.accept_clients(listener),
                    WAKE_TOKEN => shared.wake.drain(),
                    _ => self.dispatch_client_event(event),
                }
            }
        }
        Ok(())
    }

    fn accept_clients(&self, listener: &TcpListener) {
        let shared = &self.shared;
        let drain = shared.listen_edge.load(Ordering::Acquire);
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("cannot make client socket nonblocking: {e}");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    let conn = Arc::new(Mutex::new(Connection::new(stream, peer)));
                    match shared.connections.write() {
                        Ok(mut table) => {
                            table.insert(fd, conn);
                        }
                        Err(e) => {
                            log::error!("connection table poisoned; dropping {peer}: {e}");
                            continue;
                        }
                    }
                    Shared::arm_idle_timer(shared, fd);
                    if let Err(e) = shared.poller.add(fd, shared.client_interest(), fd as u64) {
                        log::warn!("cannot register client fd {fd}: {e}");
                        Shared::teardown_by_fd(shared, fd);
                        continue;
                    }
                    log::debug!("accepted {peer} on fd {fd}");
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
            if !drain {
                break;
            }
        }
    }

    fn dispatch_client_event(&self, event: Event) {
        let fd = event.token as RawFd;
        if event.is_hangup() || event.is_error() {
            log::debug!("peer hangup on fd {fd}");
            Shared::teardown_by_fd(&self.shared, fd);
        } else if event.is_readable() {
            let shared = self.shared.clone();
            self.shared
                .pool
                .submit(move || Shared::on_readable(&shared, fd));
        } else if event.is_writable() {
            let shared = self.shared.clone();
            self.shared
                .pool
                .submit(move || Shared::on_writable(&shared, fd));
        } else {
            log::warn!("unexpected event on fd {fd}");
        }
    }
}

impl Shared {
    fn connection(&self, fd: RawFd) -> Option<ConnRef> {
        self.connections.read().ok()?.get(&fd).cloned()
    }

    fn client_interest(&self) -> Interest {
        let mut interest = (Interest::READABLE | Interest::HANGUP).oneshot();
        if self.client_edge.load(Ordering::Acquire) {
            interest = interest.edge();
        }
        interest
    }

    fn write_interest(&self) -> Interest {
        let mut interest = (Interest::WRITABLE | Interest::HANGUP).oneshot();
        if self.client_edge.load(Ordering::Acquire) {
            interest = interest.edge();
        }
        interest
    }

    /// Arms (or re-arms) the one idle-expiry task of a connection. The
    /// callback shuts the socket down rather than closing it, so the
    /// poller reports the hangup on the reactor thread and normal cleanup
    /// runs there.
    fn arm_idle_timer(this: &Arc<Self>, fd: RawFd) {
        let weak: Weak<Shared> = Arc::downgrade(this);
        this.timer.add(
            fd,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if let Some(conn) = shared.connection(fd) {
                    log::debug!("idle timeout on fd {fd}");
                    conn.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .shutdown();
                }
            }),
            this.idle_timeout,
            1,
            Duration::ZERO,
        );
    }

    /// Pushes the idle deadline forward after activity; re-arms the task
    /// when it already fired.
    fn refresh_idle(this: &Arc<Self>, fd: RawFd) {
        let now = Instant::now();
        if !this.timer.update(&fd, move |task| task.reset_next_run(now)) {
            Shared::arm_idle_timer(this, fd);
        }
    }

    /// Removes every trace of a connection: poller registration, idle
    /// task, table entry, and the socket itself.
    fn teardown(&self, fd: RawFd, conn: &mut Connection) {
        let _ = self.poller.delete(fd);
        self.timer.cancel(&fd);
        conn.close();
        match self.connections.write() {
            Ok(mut table) => {
                table.remove(&fd);
            }
            Err(e) => log::error!("connection table poisoned; fd {fd} entry leaks: {e}"),
        }
    }

    fn teardown_by_fd(this: &Arc<Self>, fd: RawFd) {
        if let Some(conn) = this.connection(fd) {
            // A poisoned connection lock means a worker died mid-request;
            // the state is still safe to tear down.
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            this.teardown(fd, &mut conn);
        }
    }

    /// Reader path: drain the socket, dispatch a completed request, or
    /// re-arm for more input.
    fn on_readable(this: &Arc<Self>, fd: RawFd) {
        let Some(conn) = this.connection(fd) else {
            return;
        };
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        Shared::process_input(this, fd, &mut conn);
    }

    fn process_input(this: &Arc<Self>, fd: RawFd, conn: &mut Connection) {
        let edge = this.client_edge.load(Ordering::Acquire);
        match conn.parse_from_socket(edge) {
            Ok(Some(req)) => {
                Shared::refresh_idle(this, fd);
                Shared::dispatch_request(this, fd, conn, &req);
            }
            Ok(None) => {
                Shared::refresh_idle(this, fd);
                Shared::rearm(this, fd, conn, this.client_interest());
            }
            Err(ParseError::Read(e)) => {
                log::debug!("read failed on fd {fd}: {e}");
                this.teardown(fd, conn);
            }
            Err(err) => {
                log::warn!("bad request on fd {fd}: {err}");
                Shared::respond_bad_request(this, fd, conn);
            }
        }
    }

    /// Looks up the handler (longest prefix, then the default), runs it,
    /// and freezes the response for the writer path.
    fn dispatch_request(this: &Arc<Self>, fd: RawFd, conn: &mut Connection, req: &Request) {
        let handler = {
            let Ok(registry) = this.registry.read() else {
                log::error!("registry poisoned; dropping fd {fd}");
                this.teardown(fd, conn);
                return;
            };
            registry
                .matches(req.path())
                .or_else(|| registry.default_handler())
        };
        match handler {
            Some(handler) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler(conn.writer(), req);
                }));
                if outcome.is_err() {
                    // The response state is unknowable now; drop the
                    // connection rather than emit garbage.
                    log::error!("handler panicked for {}", req.uri());
                    this.teardown(fd, conn);
                    return;
                }
            }
            None => {
                log::debug!("no handler for {}", req.uri());
                let writer = conn.writer();
                writer.set_version(req.version());
                writer.set_status_code(StatusCode::NotFound);
                writer.write_str("404 Not Found");
            }
        }
        conn.make_response();
        Shared::rearm(this, fd, conn, this.write_interest());
    }

    /// Answers a parse error with `400 Bad Request` and closes once the
    /// response is out.
    fn respond_bad_request(this: &Arc<Self>, fd: RawFd, conn: &mut Connection) {
        conn.set_keep_alive(false);
        let writer = conn.writer();
        writer.clear();
        writer.set_version("1.1");
        writer.set_status_code(StatusCode::BadRequest);
        writer.write_str("400 Bad Request");
        conn.make_response();
        Shared::rearm(this, fd, conn, this.write_interest());
    }

    /// Writer path: one gathered write, then either re-arm for the rest,
    /// reset for the next keep-alive request, or close.
    fn on_writable(this: &Arc<Self>, fd: RawFd) {
        let Some(conn) = this.connection(fd) else {
            return;
        };
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = conn.write_to_socket();
        if let Some(e) = outcome.error {
            log::debug!("write failed on fd {fd}: {e}");
            this.teardown(fd, &mut conn);
            return;
        }
        if !outcome.done {
            Shared::refresh_idle(this, fd);
            Shared::rearm(this, fd, &mut conn, this.write_interest());
            return;
        }
        if conn.is_keep_alive() {
            conn.clear();
            Shared::refresh_idle(this, fd);
            // Surplus input the parser already buffered may hold the next
            // pipelined request; run the reader path before re-arming.
            Shared::process_input(this, fd, &mut conn);
        } else {
            this.teardown(fd, &mut conn);
        }
    }

    fn rearm(this: &Arc<Self>, fd: RawFd, conn: &mut Connection, interest: Interest) {
        if let Err(e) = this.poller.modify(fd, interest, fd as u64) {
            log::warn!("cannot re-arm fd {fd}: {e}");
            this.teardown(fd, conn);
        }
    }
}
