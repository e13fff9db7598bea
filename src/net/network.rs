//! The connection registry and its polling entry points.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ServerConfig;
use tracing::{debug, trace, warn};

use super::addr::Address;
use super::arena::{Arena, ConnectionId};
use super::connection::{Callbacks, Connection, OpenOptions, State};
use super::listener::{Accept, Listener, Listeners};
use super::poller::{Interest, Poller};
use super::resolver::{Lookup, Resolver};
use super::tls::{TlsSession, load_server_config};
use crate::config::NetConfig;
use crate::{Error, Result};

/// Owns every connection and listener and drives them from the polling
/// thread.
///
/// Nothing happens in the background: a driver iteration calls
/// [Network::wait] to sample socket readiness, then
/// [Network::check_for_connections] and [Network::poll_connections] to act on
/// it. Callbacks run on the calling thread from within those calls.
pub struct Network {
    config: NetConfig,
    poller: Poller,
    resolver: Resolver,
    connections: Arena<Connection>,
    listeners: Listeners,
    server_tls: Option<Arc<ServerConfig>>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.ports())
            .field("server_tls", &self.server_tls.is_some())
            .finish()
    }
}

impl Network {
    /// Creates a network resolving names through the system resolver.
    pub fn new(config: NetConfig) -> Result<Network> {
        Network::with_resolver(config, Resolver::default())
    }

    /// Creates a network resolving names through `lookup`.
    pub fn with_lookup(config: NetConfig, lookup: Arc<dyn Lookup>) -> Result<Network> {
        Network::with_resolver(config, Resolver::new(lookup))
    }

    fn with_resolver(config: NetConfig, resolver: Resolver) -> Result<Network> {
        config.validate()?;
        Ok(Network {
            config,
            poller: Poller::new(),
            resolver,
            connections: Arena::new(),
            listeners: Listeners::default(),
            server_tls: None,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Uses `config` for TLS listeners instead of the certificate files named
    /// in the configuration.
    pub fn set_server_tls(&mut self, config: Arc<ServerConfig>) {
        self.server_tls = Some(config);
    }

    /// The resolver, for issuing lookups directly.
    pub fn resolver(&mut self) -> &mut Resolver {
        &mut self.resolver
    }

    /// Opens a connection to `target`, an IP literal or a host name.
    ///
    /// Always returns an id; failures surface through the error callback on
    /// a later poll. The caller holds one reference, given up by
    /// [Network::close] or [Network::release].
    pub fn open(&mut self, target: &str, port: u16, options: OpenOptions, callbacks: Callbacks) -> ConnectionId {
        let Network {
            config,
            poller,
            resolver,
            connections,
            ..
        } = self;

        let id = connections.insert_with(|id| {
            Connection::open(id, target, port, options, callbacks, config, poller, resolver)
        });
        debug!("[{id}] opened to {target}:{port}");
        id
    }

    /// Queues `data` on the connection, truncated to the free output capacity.
    /// Returns the number of bytes queued; `0` for unknown or closing
    /// connections.
    pub fn send(&mut self, id: ConnectionId, data: &[u8]) -> usize {
        self.connections.get_mut(id).map_or(0, |conn| conn.send(data))
    }

    /// Closes the connection and gives up the caller's reference. Queued
    /// output is still written. Closing twice, or closing an unknown id, does
    /// nothing.
    pub fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.close_by_holder(&mut self.poller, &mut self.resolver);
        }
    }

    /// Returns `true` while the connection can exchange data.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.get(id).is_some_and(Connection::is_connected)
    }

    /// Current state, or `None` once the connection has been reclaimed.
    pub fn state(&self, id: ConnectionId) -> Option<State> {
        self.connections.get(id).map(Connection::state)
    }

    /// Number of connect attempts made for the connection.
    pub fn connect_attempts(&self, id: ConnectionId) -> Option<u32> {
        self.connections.get(id).map(Connection::connect_attempts)
    }

    /// Peer address of the connection, once known.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id).and_then(Connection::peer_addr)
    }

    /// Takes an extra reference, keeping the connection from being reclaimed
    /// or auto-closed. Returns `false` for unknown ids.
    pub fn retain(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) => {
                conn.retain();
                true
            }
            None => false,
        }
    }

    /// Gives up a reference without closing. An unreferenced connection keeps
    /// running until it ends or idles out.
    pub fn release(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.release();
        }
    }

    /// Number of connections not yet reclaimed.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Starts listening on `port` (`0` for an ephemeral port) and returns the
    /// bound port. `on_accept` is called for each accepted connection.
    pub fn listen(
        &mut self,
        port: u16,
        use_tls: bool,
        on_accept: impl FnMut(ConnectionId, &str) -> Option<Accept> + 'static,
    ) -> Result<u16> {
        if port != 0 && self.listeners.contains(port) {
            return Err(Error::AlreadyListening(port));
        }

        if use_tls && self.server_tls.is_none() {
            let files = self.config.tls.as_ref().ok_or(Error::TlsNotConfigured)?;
            self.server_tls = Some(load_server_config(files)?);
        }

        let listener = Listener::bind(port, use_tls, self.config.listen_backlog, Box::new(on_accept))?;
        let bound = listener.port();
        self.poller.register(listener.as_raw_fd(), Interest::READ);
        self.listeners.insert(listener);
        Ok(bound)
    }

    /// Stops listening on `port`. Connections already accepted are kept.
    pub fn close_listener(&mut self, port: u16) -> bool {
        match self.listeners.remove(port) {
            Some(listener) => {
                self.poller.deregister(listener.as_raw_fd());
                debug!("stopped listening on port {port}");
                true
            }
            None => false,
        }
    }

    /// Accepts pending connections on every listener the last
    /// [Network::wait] found readable and hands each to its listener's accept
    /// callback.
    pub fn check_for_connections(&mut self) {
        if self.listeners.is_empty() {
            return;
        }

        let ports = self.listeners.ports();
        let Network {
            config,
            poller,
            resolver,
            connections,
            listeners,
            server_tls,
        } = self;

        for port in ports {
            let Some(listener) = listeners.get_mut(port) else {
                continue;
            };
            if !poller.ready_for_read(listener.as_raw_fd()) {
                continue;
            }

            for (socket, peer) in listener.accept_pending() {
                let tls = if listener.uses_tls() {
                    let session = server_tls
                        .as_ref()
                        .ok_or(Error::TlsNotConfigured)
                        .and_then(|config| TlsSession::server(Arc::clone(config)));
                    match session {
                        Ok(session) => Some(session),
                        Err(err) => {
                            warn!("dropping connection from {peer}: {err}");
                            continue;
                        }
                    }
                } else {
                    None
                };

                let peer_text = Address::from(peer.ip().to_canonical()).to_string();
                let id = connections.insert_with(|id| Connection::accepted(id, socket, tls, peer, config, poller));
                debug!("[{id}] accepted {peer_text} on port {port}");

                let Some(conn) = connections.get_mut(id) else {
                    continue;
                };
                match listener.offer(id, &peer_text) {
                    Some(accept) => conn.attach(
                        accept.callbacks,
                        accept.line_buffered,
                        accept.low_delay,
                        poller,
                        resolver,
                    ),
                    None => {
                        debug!("[{id}] rejected by accept callback");
                        conn.close(poller, resolver);
                    }
                }
            }
        }
    }

    /// Advances every connection using the current wall clock.
    pub fn poll_connections(&mut self) {
        self.poll_connections_at(Instant::now());
    }

    /// Advances every connection as if the current time were `now`, then
    /// reclaims connections that ended and are no longer referenced.
    ///
    /// Socket I/O is driven by the readiness recorded by the last
    /// [Network::wait]; resolution, auto-close and reclaiming do not need it.
    pub fn poll_connections_at(&mut self, now: Instant) {
        for id in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.poll(now, &mut self.poller, &mut self.resolver);
            }
        }

        self.reclaim();
    }

    /// Blocks until a socket becomes ready or `timeout` elapses and records
    /// readiness for the following [Network::check_for_connections] and
    /// [Network::poll_connections]. Returns the number of ready sockets; a
    /// zero `timeout` only samples readiness.
    pub fn wait(&mut self, timeout: Duration) -> Result<usize> {
        self.sync_interest();
        self.poller.wait(timeout)
    }

    fn sync_interest(&mut self) {
        for conn in self.connections.values() {
            if let Some((fd, interest)) = conn.interest() {
                self.poller.set_interest(fd, interest);
            }
        }
    }

    fn reclaim(&mut self) {
        for id in self.connections.ids() {
            if self.connections.get(id).is_some_and(Connection::is_reclaimable) {
                self.connections.remove(id);
                trace!("[{id}] reclaimed");
            }
        }
    }
}
