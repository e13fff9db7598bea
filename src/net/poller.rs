//! Readiness polling over a set of registered sockets.
//!
//! The registration set is owned by the [Poller] and is never handed to the
//! kernel directly: every [Poller::wait] rebuilds a scratch `pollfd` array
//! from it, so callers may change interest between waits without worrying
//! about what a previous call left behind.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::Result;
use crate::error::errno;

/// Directions a caller wants to be woken for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest {
    /// Wake when the socket is readable (or has a pending connection).
    pub read: bool,
    /// Wake when the socket is writable (or a connect attempt finished).
    pub write: bool,
}

impl Interest {
    /// Read interest only.
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    /// Write interest only.
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    /// Both directions.
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };
    /// No interest; the socket stays registered but is not polled.
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
}

/// Readiness observed for a socket by the last [Poller::wait].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Readiness {
    /// A read will not block.
    pub readable: bool,
    /// A write will not block.
    pub writable: bool,
}

/// Registration set plus the readiness recorded by the last wait.
#[derive(Debug, Default)]
pub struct Poller {
    registrations: BTreeMap<RawFd, Interest>,
    /// Rebuilt on every wait; kept to reuse its allocation.
    scratch: Vec<libc::pollfd>,
    ready: HashMap<RawFd, Readiness>,
}

impl Poller {
    /// Creates an empty poller.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds `fd` to the registration set, replacing any previous interest and
    /// readiness recorded for a descriptor of the same number.
    pub fn register(&mut self, fd: RawFd, interest: Interest) {
        self.registrations.insert(fd, interest);
        self.ready.remove(&fd);
    }

    /// Changes the interest of a registered socket. Unknown sockets are
    /// registered.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        self.registrations.insert(fd, interest);
    }

    /// Removes `fd` from the registration set and forgets its readiness.
    ///
    /// Must be called before the socket is closed, since the descriptor number
    /// may be reused by the next socket created.
    pub fn deregister(&mut self, fd: RawFd) {
        self.registrations.remove(&fd);
        self.ready.remove(&fd);
    }

    /// Current interest of `fd`, if registered.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.registrations.get(&fd).copied()
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Blocks until a registered socket becomes ready or `timeout` elapses,
    /// returning the number of ready sockets.
    ///
    /// An interrupted wait is reported as zero ready sockets. With nothing to
    /// poll this simply sleeps for `timeout`.
    pub fn wait(&mut self, timeout: Duration) -> Result<usize> {
        self.ready.clear();
        self.scratch.clear();

        for (&fd, interest) in &self.registrations {
            let mut events: libc::c_short = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            if events != 0 {
                self.scratch.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        let nready = unsafe {
            libc::poll(
                self.scratch.as_mut_ptr(),
                self.scratch.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if nready == -1 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(errno!("failed to poll {} sockets", self.scratch.len()));
        }

        for pfd in self.scratch.iter().filter(|pfd| pfd.revents != 0) {
            // Errors and hang-ups wake both directions so the owner observes
            // them through the next read or the connect check.
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            self.ready.insert(
                pfd.fd,
                Readiness {
                    readable: failed || pfd.revents & libc::POLLIN != 0,
                    writable: failed || pfd.revents & libc::POLLOUT != 0,
                },
            );
        }

        Ok(nready as usize)
    }

    /// Readiness of `fd` observed by the last wait.
    pub fn readiness(&self, fd: RawFd) -> Readiness {
        self.ready.get(&fd).copied().unwrap_or_default()
    }

    /// Returns `true` if the last wait found `fd` readable.
    pub fn ready_for_read(&self, fd: RawFd) -> bool {
        self.readiness(fd).readable
    }

    /// Returns `true` if the last wait found `fd` writable.
    pub fn ready_for_write(&self, fd: RawFd) -> bool {
        self.readiness(fd).writable
    }
}
