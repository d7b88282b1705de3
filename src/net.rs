//! Socket plumbing for the reactor.
//!
//! The listen socket is built through libc so the backlog stays
//! configurable and `SO_REUSEADDR` is set before bind; std's listener
//! builder exposes neither. The wake fd is an eventfd the reactor
//! registers alongside its sockets, so `stop()` can interrupt a blocked
//! wait from any thread.

use std::io;
use std::net::{SocketAddrV4, TcpListener};
use std::os::unix::io::{FromRawFd, RawFd};

/// Builds a nonblocking listen socket: `SO_REUSEADDR`, bind, listen with
/// the given backlog.
pub fn listen_socket(addr: SocketAddrV4, backlog: i32) -> io::Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // From here on the fd must be closed on any failure path.
    let result = (|| {
        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&optval as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let sockaddr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                (&sockaddr as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(fd, true)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(unsafe { TcpListener::from_raw_fd(fd) }),
        Err(err) => {
            unsafe { libc::close(fd) };
            Err(err)
        }
    }
}

/// Toggles `O_NONBLOCK` on an fd.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An eventfd the reactor registers with its poller so another thread can
/// interrupt a blocked wait.
pub struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Makes the fd readable, unblocking a waiting poller.
    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd, (&one as *const u64).cast(), 8);
        }
    }

    /// Consumes pending wakeups so the fd can report again.
    pub fn drain(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(self.fd, (&mut counter as *mut u64).cast(), 8);
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
