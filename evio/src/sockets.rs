//! Owned socket descriptors and thin syscall wrappers.

use crate::inet_address::InetAddress;
use socket2::{Domain, Protocol, Type};
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use tracing::warn;

/// An owned socket file descriptor, closed on drop.
///
/// Channels reference the descriptor by number only; the `Socket` is held by
/// whichever component owns the descriptor's lifetime (acceptor or
/// connection).
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Take ownership of an already-open descriptor.
    pub fn from_fd(fd: RawFd) -> Self {
        Socket { fd }
    }

    /// Create a non-blocking IPv4 listening socket bound to `addr`.
    ///
    /// `SO_REUSEADDR` is always set; `SO_REUSEPORT` on request. The socket
    /// is not yet listening.
    pub fn bind_listener(addr: &InetAddress, reuse_port: bool) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.to_socket_addr().into())?;
        Ok(Socket {
            fd: socket.into_raw_fd(),
        })
    }

    /// Create a non-blocking, close-on-exec IPv4 stream socket (unbound).
    pub fn create_nonblocking() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn listen(&self) -> io::Result<()> {
        if unsafe { libc::listen(self.fd, libc::SOMAXCONN) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection. The returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut raw as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((Socket { fd }, InetAddress::from_raw(&raw)))
    }

    /// Start a non-blocking connect; `EINPROGRESS` is reported as `Ok`.
    pub fn connect(&self, addr: &InetAddress) -> io::Result<()> {
        let raw = addr.to_raw();
        let ret = unsafe {
            libc::connect(
                self.fd,
                &raw as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Close the write half, letting buffered data drain first.
    pub fn shutdown_write(&self) -> io::Result<()> {
        if unsafe { libc::shutdown(self.fd, libc::SHUT_WR) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = set_bool_option(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on) {
            warn!(fd = self.fd, error = %e, "SO_KEEPALIVE failed");
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = set_bool_option(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on) {
            warn!(fd = self.fd, error = %e, "TCP_NODELAY failed");
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_bool_option(fd: RawFd, level: libc::c_int, option: libc::c_int, on: bool) -> io::Result<()> {
    let value: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Write to a descriptor, mapping `-1` to the saved errno.
pub fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// The locally-bound endpoint of a descriptor.
pub fn local_address(fd: RawFd) -> io::Result<InetAddress> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddress::from_raw(&raw))
}

/// The peer endpoint of a connected descriptor.
pub fn peer_address(fd: RawFd) -> io::Result<InetAddress> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe { libc::getpeername(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddress::from_raw(&raw))
}

/// Read and clear the pending `SO_ERROR` on a descriptor.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        err
    }
}
