//! Per-connection state machine.
//!
//! ```text
//!   Unresolved ──literal──────────────────────────┐
//!       │                                         ▼
//!       └──host name──▶ Resolving ──────────▶ Connecting ──▶ Connected ──▶ ClosingAfterFlush
//!                          │          (retry once │               │                │
//!                          │         on fallback) │               │                ▼
//!                          └───────────────┬──────┴───────────────┴──────▶ Terminal(Closed | Error)
//! ```
//!
//! A connection is only ever touched by the polling thread. Errors move it to
//! `Terminal(Error(_))`, tear the socket down and are reported exactly once
//! through the error callback on the next poll.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tracing::{debug, trace, warn};

use super::addr::{Address, Family};
use super::arena::ConnectionId;
use super::buffer::{InputBuffer, OutputBuffer};
use super::poller::{Interest, Poller, Readiness};
use super::resolver::{Answer, ResolveHandle, ResolveStatus, Resolver};
use super::socket::{IoStatus, Socket};
use super::tls::{TlsSession, TlsStatus};
use crate::config::NetConfig;
use crate::error::ErrorCode;

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Closed on request, after flushing queued output.
    Closed,
    /// Failed; the code was reported through the error callback.
    Error(ErrorCode),
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, nothing issued yet.
    Unresolved,
    /// Waiting for the IPv4 and IPv6 lookups of the target.
    Resolving,
    /// Connect issued; waiting for the outcome (and the TLS handshake).
    Connecting,
    /// Exchanging data.
    Connected,
    /// Closed by the owner; writing out what is still queued.
    ClosingAfterFlush,
    /// No further I/O happens.
    Terminal(Terminal),
}

impl State {
    /// Returns `true` once the connection has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Terminal(_))
    }
}

/// Handle given to callbacks for acting on their own connection.
#[derive(Debug)]
pub struct Context<'a> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    output: &'a mut OutputBuffer,
    close_requested: &'a mut bool,
}

impl Context<'_> {
    /// Id of the connection the callback runs for.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote peer, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues `data` for sending, truncated to the free output capacity.
    /// Returns the number of bytes queued.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if *self.close_requested {
            return 0;
        }
        self.output.push(data)
    }

    /// Closes the connection once the callback returns, after queued output
    /// has been written. No further data is delivered to this connection.
    pub fn close(&mut self) {
        *self.close_requested = true;
    }
}

type ConnectFn = Box<dyn FnMut(&mut Context<'_>)>;
type ReadFn = Box<dyn FnMut(&mut Context<'_>, &[u8])>;
type ErrorFn = Box<dyn FnMut(ConnectionId, ErrorCode)>;

/// Event callbacks of a connection. Every callback is optional.
#[derive(Default)]
pub struct Callbacks {
    on_connect: Option<ConnectFn>,
    on_read: Option<ReadFn>,
    on_error: Option<ErrorFn>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Callbacks {
    /// No callbacks.
    pub fn new() -> Self {
        Default::default()
    }

    /// Called once the connection is established.
    pub fn on_connect(mut self, f: impl FnMut(&mut Context<'_>) + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Called with each received chunk, or each line in line-buffered mode.
    ///
    /// Registering a read callback also makes the connection eligible for idle
    /// auto-close.
    pub fn on_read(mut self, f: impl FnMut(&mut Context<'_>, &[u8]) + 'static) -> Self {
        self.on_read = Some(Box::new(f));
        self
    }

    /// Called exactly once if the connection fails.
    pub fn on_error(mut self, f: impl FnMut(ConnectionId, ErrorCode) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Options for an outgoing connection.
#[derive(Clone)]
pub struct OpenOptions {
    line_buffered: bool,
    low_delay: bool,
    auto_close: bool,
    tls: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("line_buffered", &self.line_buffered)
            .field("low_delay", &self.low_delay)
            .field("auto_close", &self.auto_close)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            line_buffered: false,
            low_delay: false,
            auto_close: true,
            tls: None,
        }
    }
}

impl OpenOptions {
    /// Raw delivery, Nagle enabled, auto-close enabled, no TLS.
    pub fn new() -> Self {
        Default::default()
    }

    /// Deliver input split on `\n` instead of in raw chunks.
    pub fn line_buffered(mut self, on: bool) -> Self {
        self.line_buffered = on;
        self
    }

    /// Disable Nagle's algorithm.
    pub fn low_delay(mut self, on: bool) -> Self {
        self.low_delay = on;
        self
    }

    /// Allow closing the connection after the idle timeout once nobody holds
    /// a reference to it.
    pub fn auto_close(mut self, on: bool) -> Self {
        self.auto_close = on;
        self
    }

    /// Wrap the connection in a TLS client session using `config`; the
    /// target is used as the server name.
    pub fn tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

/// Lookups issued for a host-name target. At most one pair per connection.
#[derive(Debug, Default)]
struct Lookups {
    v4: Option<ResolveHandle>,
    v6: Option<ResolveHandle>,
}

/// A single TCP (optionally TLS) connection.
pub struct Connection {
    id: ConnectionId,
    state: State,
    target: String,
    port: u16,
    options: OpenOptions,
    callbacks: Callbacks,
    socket: Option<Socket>,
    tls: Option<TlsSession>,
    /// Set once the TCP connect succeeded; a TLS client may still be
    /// handshaking in `Connecting`.
    transport_ready: bool,
    input: InputBuffer,
    output: OutputBuffer,
    lookups: Lookups,
    fallback: Option<IpAddr>,
    peer: Option<SocketAddr>,
    attempts: u32,
    last_read: Instant,
    idle_timeout: Duration,
    /// References held outside the network; see [Connection::retain].
    refs: usize,
    holder_closed: bool,
    /// Close requested before the connection was established.
    linger: bool,
    error_reported: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("port", &self.port)
            .field("peer", &self.peer)
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates an outgoing connection and starts connecting (for a literal
    /// target) or resolving (for a host name).
    ///
    /// The connection starts with one external reference.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: ConnectionId,
        target: &str,
        port: u16,
        options: OpenOptions,
        callbacks: Callbacks,
        config: &NetConfig,
        poller: &mut Poller,
        resolver: &mut Resolver,
    ) -> Connection {
        let mut conn = Connection::with_state(id, target, port, options, callbacks, config);
        conn.refs = 1;
        conn.start(poller, resolver);
        conn
    }

    /// Wraps a socket accepted by a listener. The connection starts
    /// `Connected` with no external references and no callbacks.
    pub fn accepted(
        id: ConnectionId,
        socket: Socket,
        tls: Option<TlsSession>,
        peer: SocketAddr,
        config: &NetConfig,
        poller: &mut Poller,
    ) -> Connection {
        let target = Address::from(peer.ip().to_canonical()).to_string();
        let mut conn = Connection::with_state(
            id,
            &target,
            peer.port(),
            OpenOptions::default(),
            Callbacks::default(),
            config,
        );

        poller.register(socket.as_raw_fd(), Interest::READ);
        conn.socket = Some(socket);
        conn.tls = tls;
        conn.transport_ready = true;
        conn.peer = Some(peer);
        conn.state = State::Connected;
        conn
    }

    fn with_state(
        id: ConnectionId,
        target: &str,
        port: u16,
        options: OpenOptions,
        callbacks: Callbacks,
        config: &NetConfig,
    ) -> Connection {
        Connection {
            id,
            state: State::Unresolved,
            target: target.to_owned(),
            port,
            options,
            callbacks,
            socket: None,
            tls: None,
            transport_ready: false,
            input: InputBuffer::new(config.input_buffer_size),
            output: OutputBuffer::new(config.output_buffer_size),
            lookups: Lookups::default(),
            fallback: None,
            peer: None,
            attempts: 0,
            last_read: Instant::now(),
            idle_timeout: config.idle_timeout(),
            refs: 0,
            holder_closed: false,
            linger: false,
            error_reported: false,
        }
    }

    /// Installs the callbacks and options chosen for an accepted connection
    /// and runs its connect callback.
    pub fn attach(
        &mut self,
        callbacks: Callbacks,
        line_buffered: bool,
        low_delay: bool,
        poller: &mut Poller,
        resolver: &mut Resolver,
    ) {
        self.callbacks = callbacks;
        self.options.line_buffered = line_buffered;
        if low_delay && let Some(socket) = &self.socket {
            if let Err(err) = socket.set_low_delay(true) {
                debug!("[{}] failed to set low delay: {err}", self.id);
            }
            self.options.low_delay = true;
        }
        if self.state == State::Connected {
            self.notify_connected(poller, resolver);
        }
    }

    /// Id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` while data can be exchanged.
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Number of connect attempts made so far, fallback included.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts
    }

    /// Address of the peer connected to, or being connected to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Number of external references.
    pub fn refs(&self) -> usize {
        self.refs
    }

    /// Adds an external reference.
    pub fn retain(&mut self) {
        self.refs += 1;
    }

    /// Drops an external reference. The connection keeps running; once it is
    /// terminal and unreferenced it is reclaimed.
    pub fn release(&mut self) {
        self.refs = self.refs.saturating_sub(1);
    }

    /// Close requested through the owner's handle. Releases the handle's
    /// reference; repeated calls do nothing.
    pub fn close_by_holder(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        if self.holder_closed {
            return;
        }
        self.holder_closed = true;
        self.release();
        self.close(poller, resolver);
    }

    /// Returns `true` once nothing refers to the connection any more and its
    /// error, if any, has been reported.
    pub fn is_reclaimable(&self) -> bool {
        match self.state {
            State::Terminal(Terminal::Closed) => self.refs == 0,
            State::Terminal(Terminal::Error(_)) => self.refs == 0 && self.error_reported,
            _ => false,
        }
    }

    /// Queues `data`, truncated to the free output capacity. Returns the
    /// number of bytes queued; nothing is queued once closing has begun.
    pub fn send(&mut self, data: &[u8]) -> usize {
        match self.state {
            State::ClosingAfterFlush | State::Terminal(_) => 0,
            _ if self.linger => 0,
            _ => {
                let n = self.output.push(data);
                if n < data.len() {
                    trace!(
                        "[{}] ({:?}) output full, dropped {} bytes",
                        self.id,
                        self.state,
                        data.len() - n
                    );
                }
                n
            }
        }
    }

    /// Closes the connection. Queued output is written first; a connection
    /// that is not established yet keeps connecting if it has output queued.
    pub fn close(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        match self.state {
            State::Terminal(_) | State::ClosingAfterFlush => {}
            State::Connected if self.has_pending_output() => {
                debug!("[{}] (Connected) closing after flush", self.id);
                self.state = State::ClosingAfterFlush;
            }
            State::Resolving | State::Connecting if !self.output.is_empty() => {
                debug!("[{}] ({:?}) close deferred until flushed", self.id, self.state);
                self.linger = true;
            }
            state => {
                debug!("[{}] ({state:?}) closed", self.id);
                self.teardown(true, poller, resolver);
                self.state = State::Terminal(Terminal::Closed);
            }
        }
    }

    /// Socket and interest this connection wants registered with the poller.
    pub fn interest(&self) -> Option<(RawFd, Interest)> {
        let socket = self.socket.as_ref()?;

        let wanted = match self.state {
            State::Connecting if !self.transport_ready => Interest::WRITE,
            State::Connecting => match &self.tls {
                Some(tls) => tls.handshake_interest(),
                None => Interest::WRITE,
            },
            State::Connected => Interest {
                read: true,
                write: self.has_pending_output(),
            },
            State::ClosingAfterFlush => Interest::WRITE,
            _ => Interest::NONE,
        };

        let interest = match (&self.state, &self.tls) {
            (State::Connected | State::ClosingAfterFlush, Some(tls)) => {
                tls.redirect().interest(wanted)
            }
            _ => wanted,
        };

        Some((socket.as_raw_fd(), interest))
    }

    /// Advances the connection using readiness recorded by the last
    /// [Poller::wait], then reports a new error if one occurred.
    pub fn poll(&mut self, now: Instant, poller: &mut Poller, resolver: &mut Resolver) {
        match self.state {
            State::Unresolved => self.start(poller, resolver),
            State::Resolving => self.poll_resolve(poller, resolver),
            State::Connecting => self.poll_connect(now, poller, resolver),
            State::Connected | State::ClosingAfterFlush => self.poll_io(now, poller, resolver),
            State::Terminal(_) => {}
        }

        self.report_error();
    }

    fn start(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        if let Some(addr) = Address::parse(&self.target) {
            self.attempt(addr.to_ip(), poller, resolver);
            return;
        }

        let v4 = resolver.lookup(&self.target, false);
        let v6 = resolver.lookup(&self.target, true);

        match (v4, v6) {
            (Err(err), Err(_)) => {
                warn!("[{}] (Unresolved) failed to start lookups: {err}", self.id);
                self.fail(ErrorCode::InitFailed, poller, resolver);
            }
            (v4, v6) => {
                if let Err(err) = &v6 {
                    debug!("[{}] (Unresolved) IPv6 lookup unavailable ({err}), using IPv4 only", self.id);
                }
                if let Err(err) = &v4 {
                    debug!("[{}] (Unresolved) IPv4 lookup unavailable ({err}), using IPv6 only", self.id);
                }
                self.lookups = Lookups {
                    v4: v4.ok(),
                    v6: v6.ok(),
                };
                debug!("[{}] (Unresolved) resolving {}: Unresolved -> Resolving", self.id, self.target);
                self.state = State::Resolving;
            }
        }
    }

    fn poll_resolve(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        let pending = [&self.lookups.v4, &self.lookups.v6]
            .into_iter()
            .flatten()
            .any(|handle| resolver.status(handle) == ResolveStatus::Pending);
        if pending {
            return;
        }

        let mut address_of = |handle: Option<ResolveHandle>| match handle
            .map(|handle| resolver.result(&handle))
        {
            Some(Ok(Answer::Address(ip))) => Some(ip),
            _ => None,
        };
        let v4 = address_of(self.lookups.v4.take());
        let v6 = address_of(self.lookups.v6.take());

        match (v6, v4) {
            (Some(v6), v4) => {
                debug!("[{}] (Resolving) {} -> {v6} (fallback {v4:?})", self.id, self.target);
                self.fallback = v4;
                self.attempt(v6, poller, resolver);
            }
            (None, Some(v4)) => {
                debug!("[{}] (Resolving) {} -> {v4}", self.id, self.target);
                self.attempt(v4, poller, resolver);
            }
            (None, None) => {
                debug!("[{}] (Resolving) no address found for {}", self.id, self.target);
                self.fail(ErrorCode::NoSuchHost, poller, resolver);
            }
        }
    }

    /// Issues a connect to `ip`. Failures that occur before the connect is in
    /// flight count as a failed attempt.
    fn attempt(&mut self, ip: IpAddr, poller: &mut Poller, resolver: &mut Resolver) {
        let addr = SocketAddr::new(ip, self.port);
        self.attempts += 1;
        self.peer = Some(addr);
        self.transport_ready = false;

        let socket = match Socket::create(Family::from(ip)) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("[{}] ({:?}) failed to create socket for {addr}: {err}", self.id, self.state);
                match self.fallback.take() {
                    Some(next) => self.attempt(next, poller, resolver),
                    None => self.fail(ErrorCode::InitFailed, poller, resolver),
                }
                return;
            }
        };

        if self.options.low_delay
            && let Err(err) = socket.set_low_delay(true)
        {
            debug!("[{}] failed to set low delay: {err}", self.id);
        }

        if let Err(err) = socket.connect_async(addr) {
            debug!("[{}] ({:?}) connect to {addr} failed: {err}", self.id, self.state);
            self.connect_failed(poller, resolver);
            return;
        }

        trace!("[{}] ({:?}) connecting to {addr}: -> Connecting", self.id, self.state);
        poller.register(socket.as_raw_fd(), Interest::WRITE);
        self.socket = Some(socket);
        self.state = State::Connecting;
    }

    fn connect_failed(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        self.drop_socket(poller);
        match self.fallback.take() {
            Some(next) => {
                debug!("[{}] (Connecting) retrying with fallback {next}", self.id);
                self.attempt(next, poller, resolver);
            }
            None => self.fail(ErrorCode::ConnectFailed, poller, resolver),
        }
    }

    fn poll_connect(&mut self, now: Instant, poller: &mut Poller, resolver: &mut Resolver) {
        let Some(socket) = self.socket.as_ref() else {
            self.fail(ErrorCode::InitFailed, poller, resolver);
            return;
        };

        if !self.transport_ready {
            if !poller.ready_for_write(socket.as_raw_fd()) {
                return;
            }
            if let Err(err) = socket.connect_result() {
                debug!("[{}] (Connecting) connect to {:?} failed: {err}", self.id, self.peer);
                self.connect_failed(poller, resolver);
                return;
            }
            self.transport_ready = true;

            if let Some(config) = &self.options.tls {
                match TlsSession::client(Arc::clone(config), &self.target) {
                    Ok(session) => self.tls = Some(session),
                    Err(err) => {
                        warn!("[{}] (Connecting) failed to start TLS session: {err}", self.id);
                        self.fail(ErrorCode::InitFailed, poller, resolver);
                        return;
                    }
                }
            }
        }

        if let (Some(tls), Some(socket)) = (self.tls.as_mut(), self.socket.as_ref()) {
            match tls.handshake(socket) {
                TlsStatus::Done(_) => {}
                TlsStatus::Want(direction) => {
                    trace!("[{}] (Connecting) handshake waiting for {direction:?}", self.id);
                    return;
                }
                TlsStatus::Closed(err) => {
                    debug!("[{}] (Connecting) TLS handshake failed: {err:?}", self.id);
                    self.fail(ErrorCode::ConnectFailed, poller, resolver);
                    return;
                }
            }
        }

        debug!("[{}] (Connecting) connected to {:?}: Connecting -> Connected", self.id, self.peer);
        self.state = State::Connected;
        self.last_read = now;
        self.notify_connected(poller, resolver);

        if self.linger {
            self.linger = false;
            self.close(poller, resolver);
        }
    }

    fn notify_connected(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        let mut close = false;
        if let Some(callback) = self.callbacks.on_connect.as_mut() {
            let mut ctx = Context {
                id: self.id,
                peer: self.peer,
                output: &mut self.output,
                close_requested: &mut close,
            };
            callback(&mut ctx);
        }
        if close {
            self.close(poller, resolver);
        }
    }

    fn poll_io(&mut self, now: Instant, poller: &mut Poller, resolver: &mut Resolver) {
        let Some(socket) = self.socket.as_ref() else {
            self.fail(ErrorCode::ConnectionClosed, poller, resolver);
            return;
        };

        let observed = poller.readiness(socket.as_raw_fd());
        let ready = match &self.tls {
            Some(tls) => tls.redirect().readiness(observed),
            None => observed,
        };

        // A TLS session may hold decrypted data the socket no longer signals.
        if self.state == State::Connected && (ready.readable || self.tls.is_some()) {
            let (nread, closed) = self.read_available();
            if nread > 0 {
                self.last_read = now;
                self.deliver_input(poller, resolver);
            }
            // A peer that stopped sending may still take the reply queued
            // before a close.
            if closed && self.state == State::ClosingAfterFlush {
                debug!("[{}] (ClosingAfterFlush) peer finished sending, flushing", self.id);
            } else if closed {
                self.fail(ErrorCode::ConnectionClosed, poller, resolver);
                return;
            }
        }

        if self.wants_flush(ready) {
            if let Err(err) = self.flush_output() {
                if self.state == State::ClosingAfterFlush {
                    debug!("[{}] (ClosingAfterFlush) peer gone before flush: {err:?}", self.id);
                    self.teardown(false, poller, resolver);
                    self.state = State::Terminal(Terminal::Closed);
                } else {
                    debug!("[{}] ({:?}) write failed: {err:?}", self.id, self.state);
                    self.fail(ErrorCode::ConnectionClosed, poller, resolver);
                }
                return;
            }
        }

        match self.state {
            State::ClosingAfterFlush if !self.has_pending_output() => {
                debug!("[{}] (ClosingAfterFlush) flushed: ClosingAfterFlush -> Closed", self.id);
                self.teardown(true, poller, resolver);
                self.state = State::Terminal(Terminal::Closed);
            }
            State::Connected if self.idle_expired(now) => {
                debug!(
                    "[{}] (Connected) idle for {:?}: Connected -> AutoClosed",
                    self.id, self.idle_timeout
                );
                self.fail(ErrorCode::AutoClosed, poller, resolver);
            }
            _ => {}
        }
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.options.auto_close
            && self.refs == 0
            && self.callbacks.on_read.is_some()
            && now.saturating_duration_since(self.last_read) >= self.idle_timeout
    }

    fn wants_flush(&self, ready: Readiness) -> bool {
        ready.writable && self.has_pending_output()
    }

    fn has_pending_output(&self) -> bool {
        !self.output.is_empty() || self.tls.as_ref().is_some_and(|tls| tls.has_pending_output())
    }

    /// Reads until the socket would block or the input buffer is full.
    /// Returns the number of bytes read and whether the stream ended.
    fn read_available(&mut self) -> (usize, bool) {
        let mut total = 0;

        while !self.input.is_full() {
            let Some(socket) = self.socket.as_ref() else {
                return (total, true);
            };
            let spare = self.input.spare_mut();

            let status = match self.tls.as_mut() {
                Some(tls) => match tls.read(socket, spare) {
                    TlsStatus::Done(n) => IoStatus::Done(n),
                    TlsStatus::Want(_) => IoStatus::WouldBlock,
                    TlsStatus::Closed(err) => IoStatus::Closed(err),
                },
                None => socket.read(spare),
            };

            match status {
                IoStatus::Done(0) => break,
                IoStatus::Done(n) => {
                    self.input.advance(n);
                    total += n;
                }
                IoStatus::WouldBlock => break,
                IoStatus::Closed(err) => {
                    debug!("[{}] ({:?}) stream ended: {err:?}", self.id, self.state);
                    return (total, true);
                }
            }
        }

        (total, false)
    }

    fn deliver_input(&mut self, poller: &mut Poller, resolver: &mut Resolver) {
        let mut close = false;

        match self.callbacks.on_read.as_mut() {
            Some(callback) => {
                let id = self.id;
                let peer = self.peer;
                let output = &mut self.output;
                let mut deliver = |data: &[u8]| {
                    let mut ctx = Context {
                        id,
                        peer,
                        output: &mut *output,
                        close_requested: &mut close,
                    };
                    callback(&mut ctx, data);
                    !*ctx.close_requested
                };

                if self.options.line_buffered {
                    self.input.drain_lines(deliver);
                } else {
                    self.input.drain_all(|data| {
                        deliver(data);
                    });
                }
            }
            None => self.input.drain_all(|_| {}),
        }

        if close {
            self.close(poller, resolver);
        }
    }

    /// Writes queued output until the socket would block.
    fn flush_output(&mut self) -> Result<(), Option<io::Error>> {
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return Ok(());
            };

            if self.output.is_empty() {
                if let Some(tls) = self.tls.as_mut()
                    && let TlsStatus::Closed(err) = tls.flush(socket)
                {
                    return Err(err);
                }
                return Ok(());
            }

            let status = match self.tls.as_mut() {
                Some(tls) => match tls.write(socket, self.output.pending()) {
                    TlsStatus::Done(n) => IoStatus::Done(n),
                    TlsStatus::Want(_) => IoStatus::WouldBlock,
                    TlsStatus::Closed(err) => IoStatus::Closed(err),
                },
                None => socket.write(self.output.pending()),
            };

            match status {
                IoStatus::Done(0) | IoStatus::WouldBlock => return Ok(()),
                IoStatus::Done(n) => {
                    trace!("[{}] ({:?}) wrote {n} bytes to peer", self.id, self.state);
                    self.output.consume(n);
                }
                IoStatus::Closed(err) => return Err(err),
            }
        }
    }

    fn fail(&mut self, code: ErrorCode, poller: &mut Poller, resolver: &mut Resolver) {
        if self.state.is_terminal() {
            return;
        }
        debug!("[{}] ({:?}) failed: {code}", self.id, self.state);
        self.teardown(false, poller, resolver);
        self.state = State::Terminal(Terminal::Error(code));
    }

    fn report_error(&mut self) {
        if let State::Terminal(Terminal::Error(code)) = self.state
            && !self.error_reported
        {
            self.error_reported = true;
            if let Some(callback) = self.callbacks.on_error.as_mut() {
                callback(self.id, code);
            }
        }
    }

    /// Releases the socket, TLS session, buffers and outstanding lookups.
    fn teardown(&mut self, graceful: bool, poller: &mut Poller, resolver: &mut Resolver) {
        for handle in [self.lookups.v4.take(), self.lookups.v6.take()].into_iter().flatten() {
            resolver.cancel(&handle);
        }
        self.fallback = None;

        if graceful
            && let (Some(tls), Some(socket)) = (self.tls.as_mut(), self.socket.as_ref())
        {
            tls.close(socket);
        }
        if let Some(socket) = self.socket.as_ref()
            && graceful
        {
            socket.shutdown();
        }

        self.drop_socket(poller);
        self.tls = None;
        self.input.drain_all(|_| {});
        self.output.clear();
        self.linger = false;
    }

    fn drop_socket(&mut self, poller: &mut Poller) {
        if let Some(socket) = self.socket.take() {
            poller.deregister(socket.as_raw_fd());
        }
        self.tls = None;
        self.transport_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::net::{Ipv6Addr, Shutdown, TcpListener};
    use std::rc::Rc;

    use crate::net::arena::Arena;
    use crate::net::resolver::tests::StaticLookup;

    struct Harness {
        poller: Poller,
        resolver: Resolver,
        arena: Arena<()>,
        config: NetConfig,
    }

    impl Harness {
        fn new(config: NetConfig) -> Self {
            Harness::with_lookup(config, StaticLookup::default())
        }

        fn with_lookup(config: NetConfig, lookup: StaticLookup) -> Self {
            Harness {
                poller: Poller::new(),
                resolver: Resolver::new(Arc::new(lookup)),
                arena: Arena::new(),
                config,
            }
        }

        fn open(&mut self, target: &str, port: u16, options: OpenOptions, callbacks: Callbacks) -> Connection {
            let id = self.arena.insert(());
            Connection::open(
                id,
                target,
                port,
                options,
                callbacks,
                &self.config,
                &mut self.poller,
                &mut self.resolver,
            )
        }

        fn step(&mut self, conn: &mut Connection) {
            if let Some((fd, interest)) = conn.interest() {
                self.poller.set_interest(fd, interest);
            }
            self.poller.wait(Duration::from_millis(10)).unwrap();
            conn.poll(Instant::now(), &mut self.poller, &mut self.resolver);
        }

        fn step_until(&mut self, conn: &mut Connection, mut done: impl FnMut(&Connection) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(conn) {
                assert!(Instant::now() < deadline, "condition not reached: {conn:?}");
                self.step(conn);
            }
        }
    }

    #[test]
    fn literal_target_connects_and_reports_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let connected = Rc::new(RefCell::new(0));
        let seen = Rc::clone(&connected);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new(),
            Callbacks::new().on_connect(move |ctx| {
                *seen.borrow_mut() += 1;
                ctx.send(b"hello");
            }),
        );
        assert_eq!(conn.state(), State::Connecting);

        h.step_until(&mut conn, |c| c.is_connected());
        assert_eq!(*connected.borrow(), 1);
        assert_eq!(conn.connect_attempts(), 1);

        let (mut peer, _) = listener.accept().unwrap();
        h.step_until(&mut conn, |c| c.output.is_empty());

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn refused_connect_fails_once() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new(),
            Callbacks::new().on_error(move |_, code| sink.borrow_mut().push(code)),
        );

        h.step_until(&mut conn, |c| c.state().is_terminal());
        h.step(&mut conn);
        h.step(&mut conn);

        assert_eq!(conn.state(), State::Terminal(Terminal::Error(ErrorCode::ConnectFailed)));
        assert_eq!(*errors.borrow(), [ErrorCode::ConnectFailed]);
        assert!(conn.interest().is_none());
        assert!(!conn.is_reclaimable(), "holder still references it");

        conn.close_by_holder(&mut h.poller, &mut h.resolver);
        assert!(conn.is_reclaimable());
    }

    #[test]
    fn peer_close_reported_as_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new(),
            Callbacks::new().on_error(move |_, code| sink.borrow_mut().push(code)),
        );
        h.step_until(&mut conn, |c| c.is_connected());

        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(*errors.borrow(), [ErrorCode::ConnectionClosed]);
    }

    #[test]
    fn close_with_queued_output_flushes_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let mut conn = h.open("127.0.0.1", port, OpenOptions::new(), Callbacks::new());
        assert_eq!(conn.send(b"bye"), 3);

        // Close before the connect completed: the data still goes out.
        conn.close_by_holder(&mut h.poller, &mut h.resolver);
        assert_eq!(conn.send(b"more"), 0);

        h.step_until(&mut conn, |c| c.state() == State::Terminal(Terminal::Closed));
        assert!(conn.is_reclaimable());

        let (mut peer, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn close_while_connected_enters_closing_after_flush() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let mut conn = h.open("127.0.0.1", port, OpenOptions::new(), Callbacks::new());
        h.step_until(&mut conn, |c| c.is_connected());

        conn.send(b"last words");
        conn.close(&mut h.poller, &mut h.resolver);
        assert_eq!(conn.state(), State::ClosingAfterFlush);
        assert!(conn.interest().is_some(), "socket stays open while flushing");

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(conn.state(), State::Terminal(Terminal::Closed));

        let (mut peer, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"last words");
    }

    #[test]
    fn unknown_host_fails_with_no_such_host() {
        let mut h = Harness::new(NetConfig::default());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);

        let mut conn = h.open(
            "nowhere.test",
            80,
            OpenOptions::new(),
            Callbacks::new().on_error(move |_, code| sink.borrow_mut().push(code)),
        );
        assert_eq!(conn.state(), State::Resolving);

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(*errors.borrow(), [ErrorCode::NoSuchHost]);
        assert_eq!(conn.connect_attempts(), 0);
    }

    #[test]
    fn line_mode_callback_can_reply_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new().line_buffered(true),
            Callbacks::new().on_read(move |ctx, line| {
                sink.borrow_mut().push(line.to_vec());
                if line == b"quit" {
                    ctx.send(b"ok\n");
                    ctx.close();
                }
            }),
        );
        h.step_until(&mut conn, |c| c.is_connected());

        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"hi\r\nquit\nignored\n").unwrap();

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(*lines.borrow(), [b"hi".to_vec(), b"quit".to_vec()]);

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ok\n");
    }

    #[test]
    fn reply_survives_peer_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = Harness::new(NetConfig::default());

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new().line_buffered(true),
            Callbacks::new()
                .on_read(|ctx, line| {
                    if line == b"quit" {
                        ctx.send(b"ok\n");
                        ctx.close();
                    }
                })
                .on_error(move |_, code| sink.borrow_mut().push(code)),
        );
        h.step_until(&mut conn, |c| c.is_connected());

        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"quit\n").unwrap();
        peer.shutdown(Shutdown::Write).unwrap();

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(conn.state(), State::Terminal(Terminal::Closed));
        assert!(errors.borrow().is_empty());

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ok\n");
    }

    #[test]
    fn full_input_without_newline_delivered_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = NetConfig {
            input_buffer_size: 8,
            ..Default::default()
        };
        let mut h = Harness::new(config);

        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let mut conn = h.open(
            "127.0.0.1",
            port,
            OpenOptions::new().line_buffered(true),
            Callbacks::new().on_read(move |_, line| sink.borrow_mut().push(line.to_vec())),
        );
        h.step_until(&mut conn, |c| c.is_connected());

        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"0123456789abc\n").unwrap();

        let seen = Rc::clone(&lines);
        h.step_until(&mut conn, move |_| seen.borrow().len() == 2);
        assert_eq!(*lines.borrow(), [b"01234567".to_vec(), b"89abc".to_vec()]);
        assert!(conn.is_connected());
    }

    #[test]
    fn ipv6_preferred_and_fallback_left_unused() {
        // Hosts without IPv6 loopback cannot run this.
        let Ok(listener) = TcpListener::bind((Ipv6Addr::LOCALHOST, 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let mut lookup = StaticLookup::default();
        lookup.v6.insert("dual.test".into(), IpAddr::from(Ipv6Addr::LOCALHOST));
        lookup.v4.insert("dual.test".into(), IpAddr::from([127, 0, 0, 1]));
        let mut h = Harness::with_lookup(NetConfig::default(), lookup);

        let mut conn = h.open("dual.test", port, OpenOptions::new(), Callbacks::new());
        h.step_until(&mut conn, |c| c.is_connected());

        assert_eq!(conn.connect_attempts(), 1);
        assert!(conn.peer_addr().is_some_and(|addr| addr.is_ipv6()));
    }

    #[test]
    fn ipv4_only_failure_not_retried() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let mut lookup = StaticLookup::default();
        lookup.v4.insert("v4only.test".into(), IpAddr::from([127, 0, 0, 1]));
        let mut h = Harness::with_lookup(NetConfig::default(), lookup);

        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        let mut conn = h.open(
            "v4only.test",
            port,
            OpenOptions::new(),
            Callbacks::new().on_error(move |_, code| sink.borrow_mut().push(code)),
        );

        h.step_until(&mut conn, |c| c.state().is_terminal());
        assert_eq!(conn.connect_attempts(), 1);
        assert_eq!(*errors.borrow(), [ErrorCode::ConnectFailed]);
    }
}
