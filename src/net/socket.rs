use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::error::Result;
use crate::net::addr::InetAddr;

const LISTEN_BACKLOG: i32 = 1024;

/// Exclusive owner of a kernel socket descriptor.
///
/// All sockets are created non-blocking and close-on-exec; dropping the
/// owner closes the descriptor.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking stream socket for `addr`'s family.
    pub(crate) fn new_nonblocking(addr: &InetAddr) -> Result<Socket> {
        let domain = match addr.socket_addr() {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Socket { inner })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &InetAddr) -> Result<()> {
        self.inner.bind(&SockAddr::from(addr.socket_addr()))?;
        Ok(())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.inner.listen(LISTEN_BACKLOG)
    }

    /// Accept one pending connection. The accepted socket is non-blocking
    /// and close-on-exec. Errors are returned raw so the caller can decide
    /// between retry, the idle-descriptor dance, and aborting.
    pub(crate) fn accept(&self) -> io::Result<(Socket, InetAddr)> {
        let (sock, sockaddr) = self.inner.accept()?;
        sock.set_nonblocking(true)?;
        sock.set_cloexec(true)?;
        let peer = sockaddr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((Socket { inner: sock }, InetAddr::from(peer)))
    }

    pub(crate) fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    /// Half-close: shut down the write direction, leaving reads open so
    /// peer data can still drain.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub(crate) fn local_addr(&self) -> io::Result<InetAddr> {
        let sockaddr = self.inner.local_addr()?;
        sockaddr
            .as_socket()
            .map(InetAddr::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    pub(crate) fn peer_addr(&self) -> io::Result<InetAddr> {
        let sockaddr = self.inner.peer_addr()?;
        sockaddr
            .as_socket()
            .map(InetAddr::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))
    }
}
