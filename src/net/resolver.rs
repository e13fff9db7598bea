//! Forward and reverse name resolution on background threads.
//!
//! Each request is served by exactly one detached worker thread running a
//! blocking system lookup. The worker is the only writer of the request's
//! result and publishes it through a [OnceLock], which also provides the
//! happens-before edge the polling thread relies on: nothing reads the result
//! before the completion is observed.
//!
//! A request cancelled while its worker is still running is parked on a
//! cancellation list and only released once the worker has published; the
//! list is swept whenever any result is fetched.

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::{mem, ptr, thread};

use socket2::SockAddr;
use tracing::{debug, trace};

use super::addr::Family;

/// Size of the host name buffer handed to `getnameinfo(3)` (`NI_MAXHOST`).
const MAX_HOST_LEN: usize = 1025;

/// Blocking name lookups run by resolver workers.
pub trait Lookup: Send + Sync + 'static {
    /// Resolves `host` to one address of the given family.
    fn forward(&self, host: &str, family: Family) -> Option<IpAddr>;

    /// Resolves `ip` to a host name.
    fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// [Lookup] backed by `getaddrinfo(3)` and `getnameinfo(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

impl Lookup for SystemLookup {
    fn forward(&self, host: &str, family: Family) -> Option<IpAddr> {
        let c_host = CString::new(host).ok()?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = match family {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        };
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut res) };
        if rc != 0 {
            trace!("getaddrinfo({host}, {family:?}) failed with code {rc}");
            return None;
        }

        let mut found = None;
        let mut cur = res;
        while !cur.is_null() && found.is_none() {
            let info = unsafe { &*cur };
            if !info.ai_addr.is_null() {
                found = match info.ai_family {
                    libc::AF_INET if family == Family::V4 => {
                        let sin = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
                        Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
                    }
                    libc::AF_INET6 if family == Family::V6 => {
                        let sin6 = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
                        Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
                    }
                    _ => None,
                };
            }
            cur = info.ai_next;
        }

        unsafe { libc::freeaddrinfo(res) };
        found
    }

    fn reverse(&self, ip: IpAddr) -> Option<String> {
        let addr = SockAddr::from(SocketAddr::new(ip, 0));
        let mut host = [0 as libc::c_char; MAX_HOST_LEN];

        let rc = unsafe {
            libc::getnameinfo(
                addr.as_ptr(),
                addr.len(),
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            trace!("getnameinfo({ip}) failed with code {rc}");
            return None;
        }

        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }
}

/// What a request resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Host name to address of one family.
    Forward {
        /// Host name to resolve.
        host: String,
        /// Family of the wanted address.
        family: Family,
    },
    /// Address to host name.
    Reverse(IpAddr),
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Result of a forward lookup.
    Address(IpAddr),
    /// Result of a reverse lookup.
    Hostname(String),
}

/// Progress of a request as seen by the polling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The worker has not published yet.
    Pending,
    /// A result is available.
    Success,
    /// The lookup finished without a result, or the request was cancelled.
    Failure,
}

/// Why [Resolver::result] returned no answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The worker has not published yet.
    #[error("lookup still pending")]
    Pending,
    /// The lookup finished without finding anything.
    #[error("host not found")]
    NotFound,
    /// The request was cancelled by its owner.
    #[error("lookup cancelled")]
    Cancelled,
}

struct Request {
    kind: RequestKind,
    /// Written once by the worker; `None` means the lookup failed.
    result: OnceLock<Option<Answer>>,
    cancelled: AtomicBool,
}

/// Handle of an outstanding or completed request.
#[derive(Clone)]
pub struct ResolveHandle {
    request: Arc<Request>,
}

impl ResolveHandle {
    /// What this request resolves.
    pub fn kind(&self) -> &RequestKind {
        &self.request.kind
    }

    fn is_complete(&self) -> bool {
        self.request.result.get().is_some()
    }
}

impl fmt::Debug for ResolveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveHandle")
            .field("kind", &self.request.kind)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Spawns lookup workers and tracks cancelled requests.
pub struct Resolver {
    lookup: Arc<dyn Lookup>,
    cancelled: Vec<ResolveHandle>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("cancelled", &self.cancelled.len())
            .finish()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new(Arc::new(SystemLookup))
    }
}

impl Resolver {
    /// Creates a resolver running lookups through `lookup`.
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        Resolver {
            lookup,
            cancelled: Vec::new(),
        }
    }

    /// Starts resolving `host` to an IPv6 address if `want_ipv6`, otherwise to
    /// an IPv4 address.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread could not be spawned.
    pub fn lookup(&mut self, host: &str, want_ipv6: bool) -> io::Result<ResolveHandle> {
        let family = if want_ipv6 { Family::V6 } else { Family::V4 };
        self.spawn(RequestKind::Forward {
            host: host.to_owned(),
            family,
        })
    }

    /// Starts resolving `ip` to a host name.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread could not be spawned.
    pub fn reverse_lookup(&mut self, ip: IpAddr) -> io::Result<ResolveHandle> {
        self.spawn(RequestKind::Reverse(ip))
    }

    fn spawn(&mut self, kind: RequestKind) -> io::Result<ResolveHandle> {
        let request = Arc::new(Request {
            kind,
            result: OnceLock::new(),
            cancelled: AtomicBool::new(false),
        });

        let worker_request = Arc::clone(&request);
        let lookup = Arc::clone(&self.lookup);

        thread::Builder::new()
            .name("tcpnet-resolver".into())
            .spawn(move || {
                let answer = match &worker_request.kind {
                    RequestKind::Forward { host, family } => {
                        lookup.forward(host, *family).map(Answer::Address)
                    }
                    RequestKind::Reverse(ip) => lookup.reverse(*ip).map(Answer::Hostname),
                };

                if worker_request.cancelled.load(Ordering::Relaxed) {
                    trace!("{:?} finished after cancellation", worker_request.kind);
                }
                let _ = worker_request.result.set(answer);
            })?;

        Ok(ResolveHandle { request })
    }

    /// Polls a request without blocking.
    pub fn status(&self, handle: &ResolveHandle) -> ResolveStatus {
        if handle.request.cancelled.load(Ordering::Relaxed) {
            return ResolveStatus::Failure;
        }
        match handle.request.result.get() {
            None => ResolveStatus::Pending,
            Some(Some(_)) => ResolveStatus::Success,
            Some(None) => ResolveStatus::Failure,
        }
    }

    /// Fetches the answer of a completed request.
    ///
    /// Every call also releases cancelled requests whose workers have since
    /// finished.
    pub fn result(&mut self, handle: &ResolveHandle) -> Result<Answer, ResolveError> {
        self.sweep();

        if handle.request.cancelled.load(Ordering::Relaxed) {
            return Err(ResolveError::Cancelled);
        }
        match handle.request.result.get() {
            None => Err(ResolveError::Pending),
            Some(Some(answer)) => Ok(answer.clone()),
            Some(None) => Err(ResolveError::NotFound),
        }
    }

    /// Abandons a request. A completed request is released immediately; a
    /// pending one is parked until its worker publishes.
    pub fn cancel(&mut self, handle: &ResolveHandle) {
        if handle.request.cancelled.swap(true, Ordering::Relaxed) {
            return;
        }
        if !handle.is_complete() {
            debug!("{:?} cancelled while pending", handle.request.kind);
            self.cancelled.push(handle.clone());
        }
    }

    /// Number of cancelled requests still waiting for their workers.
    pub fn pending_cancellations(&self) -> usize {
        self.cancelled.len()
    }

    fn sweep(&mut self) {
        self.cancelled.retain(|handle| !handle.is_complete());
    }
}
