//! Non-blocking socket primitives.
//!
//! Every socket handed out by this module is already in non-blocking mode.
//! I/O results are classified into transient conditions, which the caller
//! retries on a later readiness edge and never reports, and fatal ones, which
//! end the stream.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

use super::addr::Family;

/// Outcome of a single non-blocking read or write.
#[derive(Debug)]
pub enum IoStatus {
    /// This many bytes were transferred.
    Done(usize),
    /// The operation would block; retry on the next readiness edge.
    WouldBlock,
    /// The peer closed the stream or the socket failed.
    Closed(Option<io::Error>),
}

/// Returns `true` for errors that only mean "try again later".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// A non-blocking TCP socket.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Creates a TCP socket of the given family, switched to non-blocking mode
    /// before it is returned.
    pub fn create(family: Family) -> io::Result<Socket> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let inner = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    /// Creates a socket bound to `port` on every local address and listening
    /// for connections.
    ///
    /// A dual-stack IPv6 socket is preferred; hosts without IPv6 fall back to
    /// an IPv4-only socket.
    pub fn listen(port: u16, backlog: i32) -> io::Result<Socket> {
        match Self::listen_on(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), backlog) {
            Ok(socket) => Ok(socket),
            Err(err) => {
                tracing::debug!("dual-stack listener on port {port} unavailable ({err}), using IPv4");
                Self::listen_on(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port), backlog)
            }
        }
    }

    fn listen_on(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
        let inner = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_reuse_address(true)?;
        if addr.is_ipv6() {
            inner.set_only_v6(false)?;
        }
        inner.bind(&SockAddr::from(addr))?;
        inner.listen(backlog)?;
        Ok(Socket { inner })
    }

    /// Issues a connect to `addr` and returns immediately.
    ///
    /// The outcome is learned later: once the poller reports the socket
    /// writable, [Socket::connect_result] tells success from failure.
    pub fn connect_async(&self, addr: SocketAddr) -> io::Result<()> {
        match self.inner.connect(&SockAddr::from(addr)) {
            Ok(()) => Ok(()),
            Err(err) if is_transient(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Checks a connect attempt that the poller reported writable.
    ///
    /// Returns the pending socket error, or a `NotConnected` error if the
    /// kernel reports no error but the socket has no peer.
    pub fn connect_result(&self) -> io::Result<()> {
        if let Some(err) = self.inner.take_error()? {
            return Err(err);
        }
        self.inner.peer_addr().map(|_| ())
    }

    /// Accepts one pending connection, returning `None` when the backlog is
    /// empty. The new socket is non-blocking.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        match self.inner.accept() {
            Ok((inner, addr)) => {
                inner.set_nonblocking(true)?;
                let addr = addr.as_socket().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "peer address is not an IP address")
                })?;
                Ok(Some((Socket { inner }, addr)))
            }
            Err(err) if is_transient(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Disables Nagle's algorithm.
    pub fn set_low_delay(&self, low_delay: bool) -> io::Result<()> {
        self.inner.set_nodelay(low_delay)
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "local address is not an IP address")
        })
    }

    /// Reads into `buf` without blocking.
    pub fn read(&self, buf: &mut [u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Done(0);
        }
        match (&self.inner).read(buf) {
            Ok(0) => IoStatus::Closed(None),
            Ok(n) => IoStatus::Done(n),
            Err(err) if is_transient(&err) => IoStatus::WouldBlock,
            Err(err) => IoStatus::Closed(Some(err)),
        }
    }

    /// Writes as much of `buf` as the kernel accepts without blocking.
    pub fn write(&self, buf: &[u8]) -> IoStatus {
        match (&self.inner).write(buf) {
            Ok(n) => IoStatus::Done(n),
            Err(err) if is_transient(&err) => IoStatus::WouldBlock,
            Err(err) => IoStatus::Closed(Some(err)),
        }
    }

    /// Shuts down both directions, ignoring sockets that are already
    /// disconnected.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
