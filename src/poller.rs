//! A thin, thread-safe wrapper over Linux epoll.
//!
//! One reactor thread blocks in [`Poller::wait`] while workers re-arm fds
//! through [`Poller::modify`]; the kernel allows `epoll_ctl` concurrent
//! with a blocked `epoll_wait`, and a newly added fd that becomes ready
//! unblocks the waiting call. The ready-event buffer is swapped out of the
//! poller for the duration of the wait so registration calls never contend
//! with it.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Smallest ready-event buffer the adaptive policy will shrink to.
pub const MIN_EVENT_CAPACITY: usize = 4096;

/// A set of readiness conditions plus delivery-mode modifiers, convertible
/// to an epoll event mask.
///
/// ```
/// use erebus::poller::Interest;
///
/// let client = (Interest::READABLE | Interest::HANGUP).edge().oneshot();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// The fd has bytes to read.
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// The fd accepts writes.
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// The peer shut down its write side.
    pub const HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);

    /// Edge-triggered delivery: one report per readiness transition; the
    /// consumer must drain until `WouldBlock`.
    pub fn edge(self) -> Self {
        Interest(self.0 | libc::EPOLLET as u32)
    }

    /// One-shot delivery: after one event the fd stays muted until re-armed
    /// via [`Poller::modify`].
    pub fn oneshot(self) -> Self {
        Interest(self.0 | libc::EPOLLONESHOT as u32)
    }

    /// Wake only one of several waiters sharing the fd.
    pub fn exclusive(self) -> Self {
        Interest(self.0 | libc::EPOLLEXCLUSIVE as u32)
    }

    fn mask(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One ready event: the registered token plus the condition flags.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    flags: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hangup, either half (`EPOLLRDHUP`) or full (`EPOLLHUP`).
    pub fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }
}

/// The epoll instance.
pub struct Poller {
    epfd: RawFd,
    /// Number of fds currently on the epoll tree.
    registered: AtomicUsize,
    /// Capacity the ready buffer should have on the next wait.
    desired_capacity: AtomicUsize,
    min_capacity: usize,
    /// Ready-event scratch buffer; swapped out while a wait is in flight.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Self::with_min_capacity(MIN_EVENT_CAPACITY)
    }

    /// Creates a poller whose ready buffer never shrinks below
    /// `min_capacity` entries.
    pub fn with_min_capacity(min_capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let min_capacity = min_capacity.max(1);
        Ok(Self {
            epfd,
            registered: AtomicUsize::new(0),
            desired_capacity: AtomicUsize::new(min_capacity),
            min_capacity,
            events: Mutex::new(vec![zeroed_event(); min_capacity]),
        })
    }

    /// Adds `fd` to the epoll tree, delivering events carrying `token`.
    pub fn add(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some((interest, token)))?;
        self.registered.fetch_add(1, Ordering::AcqRel);
        self.adapt_capacity();
        Ok(())
    }

    /// Replaces the registration for `fd`; also re-arms a one-shot fd.
    pub fn modify(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some((interest, token)))
    }

    /// Removes `fd` from the epoll tree.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)?;
        self.registered.fetch_sub(1, Ordering::AcqRel);
        self.adapt_capacity();
        Ok(())
    }

    /// Blocks up to `timeout_ms` milliseconds (`-1` forever) and returns
    /// the ready events, at most one buffer's worth.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        // The scratch buffer is replaceable, so a poisoned lock is
        // recovered rather than failing every later wait.
        let mut buf = {
            let mut slot = self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *slot)
        };
        let desired = self.desired_capacity.load(Ordering::Acquire);
        if buf.len() != desired {
            buf.resize(desired, zeroed_event());
        }

        let n = unsafe {
            libc::epoll_wait(self.epfd, buf.as_mut_ptr(), buf.len() as i32, timeout_ms)
        };
        let result = if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(buf[..n as usize]
                .iter()
                .map(|e| Event {
                    token: e.u64,
                    flags: e.events,
                })
                .collect())
        };

        let mut slot = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = buf;
        result
    }

    /// Number of fds on the epoll tree.
    pub fn len(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ready-buffer capacity target.
    pub fn capacity(&self) -> usize {
        self.desired_capacity.load(Ordering::Acquire)
    }

    fn ctl(&self, op: i32, fd: RawFd, data: Option<(Interest, u64)>) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut event = zeroed_event();
        let event_ptr = match data {
            Some((interest, token)) => {
                event.events = interest.mask();
                event.u64 = token;
                &mut event as *mut libc::epoll_event
            }
            None => std::ptr::null_mut(),
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sizes the ready buffer to the registered count: grow by 1.5x when
    /// the tree outgrows the buffer, shrink toward 3/4 when it falls below
    /// half, never below the floor. Applied by the next wait.
    fn adapt_capacity(&self) {
        let n = self.registered.load(Ordering::Acquire);
        let cap = self.desired_capacity.load(Ordering::Acquire);
        let next = if n > cap {
            (n * 3 / 2).max(cap + 1)
        } else if n < cap / 2 && cap > self.min_capacity {
            (cap * 3 / 4).max(self.min_capacity)
        } else {
            return;
        };
        self.desired_capacity.store(next, Ordering::Release);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn zeroed_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}
