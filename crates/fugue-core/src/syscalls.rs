// src/syscalls.rs
//! Thin wrappers over the Linux socket, sendfile and epoll calls used by
//! the event loop. Every wrapper returns `io::Result` and retries `EINTR`;
//! "would block" comes back as `io::ErrorKind::WouldBlock`.
use crate::error::{FugueError, FugueResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ptr;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_event};

fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

fn cvt_size(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

fn set_flag(fd: c_int, level: c_int, name: c_int) -> io::Result<()> {
    let one: c_int = 1;
    // SAFETY: `one` outlives the call and the length matches its type.
    unsafe {
        cvt(libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ))?;
    }
    Ok(())
}

/// Resolve `host:port` to the first socket address it names.
pub fn resolve(host: &str, port: u16) -> FugueResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| FugueError::Address(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| FugueError::Address(format!("{host}:{port}: no address")))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR and SO_REUSEPORT so
/// that every worker can bind its own socket to the same port.
pub fn create_listen_socket(host: &str, port: u16, backlog: c_int) -> FugueResult<c_int> {
    let addr = resolve(host, port)?;
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // SAFETY: plain socket(2) call, the descriptor is checked below.
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    let fd = cvt(fd)?;

    let setup = || -> io::Result<()> {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)?;
        bind_addr(fd, &addr)?;
        // SAFETY: fd is a bound stream socket.
        unsafe { cvt(libc::listen(fd, backlog))? };
        Ok(())
    };

    if let Err(err) = setup() {
        close_fd(fd);
        return Err(err.into());
    }
    Ok(fd)
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: `sin` is a fully initialised sockaddr_in.
            unsafe {
                cvt(libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ))?;
            }
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // SAFETY: `sin6` is a fully initialised sockaddr_in6.
            unsafe {
                cvt(libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ))?;
            }
        }
    }
    Ok(())
}

/// Port the socket is actually bound to (useful after binding port 0).
pub fn local_port(fd: c_int) -> io::Result<u16> {
    // SAFETY: sockaddr_storage is large enough for any address family.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        cvt(libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
    }
    let port = match storage.ss_family as c_int {
        libc::AF_INET => {
            // SAFETY: family says this is a sockaddr_in.
            let sin = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
            u16::from_be(sin.sin_port)
        }
        _ => {
            // SAFETY: the only other family we bind is AF_INET6.
            let sin6 = unsafe { *(&storage as *const _ as *const libc::sockaddr_in6) };
            u16::from_be(sin6.sin6_port)
        }
    };
    Ok(port)
}

/// Accept one pending connection. `Ok(None)` when the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    loop {
        // SAFETY: null address pointers are allowed by accept4(2).
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            return Ok(Some(fd));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// Disable Nagle on an accepted socket.
pub fn set_nodelay(fd: c_int) -> io::Result<()> {
    set_flag(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)
}

/// `Ok(0)` means the peer closed its side.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        match cvt_size(res) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Non-blocking send that never raises SIGPIPE.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let res = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        match cvt_size(res) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Zero-copy transfer of up to `count` bytes from the file's current offset.
pub fn sendfile_nonblocking(fd: c_int, file_fd: c_int, count: usize) -> io::Result<usize> {
    loop {
        // SAFETY: a null offset makes the kernel use and advance the file position.
        let res = unsafe { libc::sendfile(fd, file_fd, ptr::null_mut(), count) };
        match cvt_size(res) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub fn shutdown_both(fd: c_int) {
    // SAFETY: shutdown on a stale descriptor only yields EBADF/ENOTCONN.
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub fn close_fd(fd: c_int) {
    // SAFETY: callers own `fd` and never use it afterwards.
    unsafe {
        libc::close(fd);
    }
}

/// Writes to half-closed sockets must surface as EPIPE, not kill the process.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll Operations ----

/// Level-triggered epoll instance. Level triggering keeps a connection
/// readable until its buffered bytes are drained in bounded chunks.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain epoll_create1(2) call.
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> c_int {
        self.fd
    }

    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        // SAFETY: a null event is permitted for EPOLL_CTL_DEL since 2.6.9.
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        match cvt(res) {
            Err(e) if e.raw_os_error() != Some(libc::ENOENT) => Err(e),
            _ => Ok(()),
        }
    }

    /// Returns the number of ready events; `EINTR` reports zero.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: events is valid for events.len() entries.
        let res = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
        };
        match cvt(res) {
            Ok(n) => Ok(n as usize),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Change the interest set of `fd` on the epoll instance `epoll_fd`.
pub fn epoll_ctl(
    epoll_fd: c_int,
    op: c_int,
    fd: c_int,
    token: u64,
    interests: i32,
) -> io::Result<()> {
    let mut event = epoll_event {
        events: interests as u32,
        u64: token,
    };
    // SAFETY: event is a valid epoll_event for the duration of the call.
    unsafe { cvt(libc::epoll_ctl(epoll_fd, op, fd, &mut event))? };
    Ok(())
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}
