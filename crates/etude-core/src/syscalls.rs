// src/syscalls.rs
//
// Thin wrappers over the raw socket, epoll and mmap calls the engine
// needs. Linux only: the reactor depends on epoll one-shot semantics,
// accept4 and writev.
use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{EngineError, EngineResult};

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Pending-connection backlog for the listening socket.
pub const LISTEN_BACKLOG: c_int = 64;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16) -> EngineResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| EngineError::InvalidAddr(addr_str))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> EngineResult<()> {
    unsafe {
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
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
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
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Local address of a bound socket. Lets callers bind port 0 and learn
/// the ephemeral port the kernel picked.
pub fn local_addr(fd: c_int) -> EngineResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        storage_to_addr(&storage)
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> EngineResult<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = sin.sin_addr.s_addr.to_ne_bytes();
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(EngineError::InvalidAddr(format!(
            "unsupported address family {family}"
        ))),
    }
}

/// Accept one pending connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> EngineResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let peer = storage_to_addr(&storage)?;
            Ok(Some((fd, peer)))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Non-blocking data transfer ----

/// Raw non-blocking receive. Would-block surfaces as an error; a zero
/// return is end-of-stream.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Vectored non-blocking send: multiple buffers in a single syscall.
/// Empty slices are skipped; at most four segments are submitted.
pub fn sendv_nonblocking(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let mut count = 0;
    for buf in bufs.iter().take(iovecs.len()) {
        if buf.is_empty() {
            continue;
        }
        iovecs[count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        count += 1;
    }
    if count == 0 {
        return Ok(0);
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), count as c_int) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Epoll Operations ----

/// Owned epoll instance. All registrations are edge triggered; callers
/// compose one-shot and hangup interest into `interests`.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EngineResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> EngineResult<()> {
        let mut event = epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-arm a one-shot registration with a fresh interest set.
    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> EngineResult<()> {
        let mut event = epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> EngineResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness. A signal interruption reports zero events; any
    /// other failure is fatal to the caller's loop.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EngineResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
