//! Listening sockets and the accept handshake with the owner.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, warn};

use super::arena::ConnectionId;
use super::connection::Callbacks;
use super::socket::Socket;

/// What the accept callback attaches to a newly accepted connection.
#[derive(Debug, Default)]
pub struct Accept {
    pub(crate) callbacks: Callbacks,
    pub(crate) line_buffered: bool,
    pub(crate) low_delay: bool,
}

impl Accept {
    /// Accept with `callbacks`, raw delivery and Nagle enabled.
    pub fn new(callbacks: Callbacks) -> Self {
        Accept {
            callbacks,
            ..Default::default()
        }
    }

    /// Deliver input split on `\n`.
    pub fn line_buffered(mut self, on: bool) -> Self {
        self.line_buffered = on;
        self
    }

    /// Disable Nagle's algorithm.
    pub fn low_delay(mut self, on: bool) -> Self {
        self.low_delay = on;
        self
    }
}

/// Called for every accepted connection with its id and the peer address in
/// text form. Returning `None` rejects the connection.
pub type AcceptFn = Box<dyn FnMut(ConnectionId, &str) -> Option<Accept>>;

/// A socket listening on one port.
pub struct Listener {
    port: u16,
    socket: Socket,
    tls: bool,
    on_accept: AcceptFn,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.port)
            .field("fd", &self.socket.as_raw_fd())
            .field("tls", &self.tls)
            .finish()
    }
}

impl Listener {
    /// Binds and listens on `port`; `0` picks an ephemeral port.
    pub fn bind(port: u16, tls: bool, backlog: i32, on_accept: AcceptFn) -> std::io::Result<Listener> {
        let socket = Socket::listen(port, backlog)?;
        let port = socket.local_addr()?.port();
        debug!("listening on port {port} (tls: {tls})");

        Ok(Listener {
            port,
            socket,
            tls,
            on_accept,
        })
    }

    /// Port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if accepted connections are wrapped in TLS.
    pub fn uses_tls(&self) -> bool {
        self.tls
    }

    /// Accepts every pending connection until the backlog is empty.
    pub fn accept_pending(&self) -> Vec<(Socket, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.socket.accept() {
                Ok(Some(pair)) => accepted.push(pair),
                Ok(None) => break,
                Err(err) => {
                    warn!("accept on port {} failed: {err}", self.port);
                    break;
                }
            }
        }
        accepted
    }

    /// Asks the owner what to do with a new connection.
    pub fn offer(&mut self, id: ConnectionId, peer: &str) -> Option<Accept> {
        (self.on_accept)(id, peer)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Listeners keyed by bound port.
#[derive(Debug, Default)]
pub struct Listeners {
    by_port: BTreeMap<u16, Listener>,
}

impl Listeners {
    /// Returns `true` if something already listens on `port`.
    pub fn contains(&self, port: u16) -> bool {
        self.by_port.contains_key(&port)
    }

    /// Adds a bound listener.
    pub fn insert(&mut self, listener: Listener) {
        self.by_port.insert(listener.port(), listener);
    }

    /// Removes the listener on `port`.
    pub fn remove(&mut self, port: u16) -> Option<Listener> {
        self.by_port.remove(&port)
    }

    /// Bound ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        self.by_port.keys().copied().collect()
    }

    /// Mutable access to the listener on `port`.
    pub fn get_mut(&mut self, port: u16) -> Option<&mut Listener> {
        self.by_port.get_mut(&port)
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    /// Returns `true` if nothing listens.
    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }
}
