//! TLS sessions over non-blocking sockets.
//!
//! A TLS operation in one direction can require transport I/O in the other: a
//! read may have to flush handshake records first, and a write issued while
//! the handshake still waits for the peer needs a read before any application
//! data can go out. [Redirect] records which of these is in progress so the
//! owner can register the interest the session actually needs, which may
//! differ from the direction the owner asked for.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use super::poller::{Interest, Readiness};
use super::socket::{Socket, is_transient};
use crate::config::TlsFiles;
use crate::{Error, Result};

/// Transport direction a stalled TLS operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The socket must become readable.
    Read,
    /// The socket must become writable.
    Write,
}

/// Half-duplex bookkeeping of a TLS socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Redirect {
    /// Interest and readiness pass through unchanged.
    #[default]
    Normal,
    /// A write is stalled until the socket becomes readable.
    WriteRedirectedForRead,
    /// A read is stalled until the socket becomes writable.
    ReadRedirectedForWrite,
}

impl Redirect {
    /// Maps the interest the owner wants to the interest registered with the
    /// poller.
    pub fn interest(self, wanted: Interest) -> Interest {
        match self {
            Redirect::Normal => wanted,
            Redirect::WriteRedirectedForRead => Interest {
                read: wanted.read || wanted.write,
                write: false,
            },
            Redirect::ReadRedirectedForWrite => Interest {
                read: false,
                write: wanted.read || wanted.write,
            },
        }
    }

    /// Maps readiness observed by the poller back to the directions the owner
    /// may retry.
    pub fn readiness(self, observed: Readiness) -> Readiness {
        match self {
            Redirect::Normal => observed,
            Redirect::WriteRedirectedForRead => Readiness {
                readable: observed.readable,
                writable: observed.readable,
            },
            Redirect::ReadRedirectedForWrite => Readiness {
                readable: observed.writable,
                writable: observed.writable,
            },
        }
    }

    /// State after a read finished with `status`.
    pub fn after_read(self, status: &TlsStatus) -> Redirect {
        match status {
            TlsStatus::Want(Direction::Write) => Redirect::ReadRedirectedForWrite,
            TlsStatus::Want(Direction::Read) if self == Redirect::WriteRedirectedForRead => self,
            _ => Redirect::Normal,
        }
    }

    /// State after a write finished with `status`.
    pub fn after_write(self, status: &TlsStatus) -> Redirect {
        match status {
            TlsStatus::Want(Direction::Read) => Redirect::WriteRedirectedForRead,
            TlsStatus::Want(Direction::Write) if self == Redirect::ReadRedirectedForWrite => self,
            _ => Redirect::Normal,
        }
    }
}

/// Outcome of a TLS operation.
#[derive(Debug)]
pub enum TlsStatus {
    /// Bytes of plaintext transferred; `0` for a completed handshake or flush.
    Done(usize),
    /// The operation stalled on the given transport direction.
    Want(Direction),
    /// The peer closed the session or a fatal TLS or I/O error occurred.
    Closed(Option<io::Error>),
}

enum Fill {
    Records,
    Empty,
    Eof,
}

/// A client or server TLS session bound to one socket.
pub struct TlsSession {
    conn: Connection,
    redirect: Redirect,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .field("redirect", &self.redirect)
            .finish()
    }
}

impl TlsSession {
    /// Starts a client session verifying the server as `host`.
    pub fn client(config: Arc<ClientConfig>, host: &str) -> Result<Self> {
        let name = ServerName::try_from(host.to_owned()).map_err(|err| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?;
        let conn = ClientConnection::new(config, name)?;
        Ok(TlsSession {
            conn: conn.into(),
            redirect: Redirect::Normal,
        })
    }

    /// Starts a server session for an accepted socket.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(TlsSession {
            conn: conn.into(),
            redirect: Redirect::Normal,
        })
    }

    /// Current half-duplex state.
    pub fn redirect(&self) -> Redirect {
        self.redirect
    }

    /// Returns `true` until the handshake has completed.
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Returns `true` if encrypted records are waiting to be written.
    pub fn has_pending_output(&self) -> bool {
        self.conn.wants_write()
    }

    /// Interest needed to advance the handshake.
    pub fn handshake_interest(&self) -> Interest {
        Interest {
            read: self.conn.wants_read(),
            write: self.conn.wants_write(),
        }
    }

    /// Advances the handshake as far as the socket allows.
    pub fn handshake(&mut self, socket: &Socket) -> TlsStatus {
        while self.conn.is_handshaking() {
            match self.flush_records(socket) {
                Ok(true) => {}
                Ok(false) => return TlsStatus::Want(Direction::Write),
                Err(err) => return TlsStatus::Closed(Some(err)),
            }
            if !self.conn.is_handshaking() {
                break;
            }
            if !self.conn.wants_read() {
                return TlsStatus::Want(Direction::Write);
            }
            match self.fill(socket) {
                Ok(Fill::Records) => {}
                Ok(Fill::Empty) => return TlsStatus::Want(Direction::Read),
                Ok(Fill::Eof) => return TlsStatus::Closed(None),
                Err(err) => return TlsStatus::Closed(Some(err)),
            }
        }

        // The final flight may still be queued; it goes out with later writes.
        match self.flush_records(socket) {
            Err(err) => TlsStatus::Closed(Some(err)),
            Ok(_) => TlsStatus::Done(0),
        }
    }

    /// Reads decrypted application data into `buf`.
    pub fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> TlsStatus {
        let status = self.read_inner(socket, buf);
        self.redirect = self.redirect.after_read(&status);
        status
    }

    fn read_inner(&mut self, socket: &Socket, buf: &mut [u8]) -> TlsStatus {
        let mut eof = false;

        loop {
            match self.conn.reader().read(buf) {
                Ok(0) if !buf.is_empty() => return TlsStatus::Closed(None),
                Ok(n) => return TlsStatus::Done(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return TlsStatus::Closed(Some(err)),
            }

            if eof {
                return TlsStatus::Closed(None);
            }

            // Handshake records owed to the peer must leave before more
            // records can be expected back.
            if self.conn.is_handshaking() {
                match self.flush_records(socket) {
                    Ok(true) => {}
                    Ok(false) => return TlsStatus::Want(Direction::Write),
                    Err(err) => return TlsStatus::Closed(Some(err)),
                }
            }

            match self.fill(socket) {
                Ok(Fill::Records) => {}
                Ok(Fill::Empty) => return TlsStatus::Want(Direction::Read),
                Ok(Fill::Eof) => eof = true,
                Err(err) => return TlsStatus::Closed(Some(err)),
            }
        }
    }

    /// Encrypts as much of `data` as the session accepts and flushes records
    /// to the socket.
    pub fn write(&mut self, socket: &Socket, data: &[u8]) -> TlsStatus {
        let status = self.write_inner(socket, data);
        self.redirect = self.redirect.after_write(&status);
        status
    }

    fn write_inner(&mut self, socket: &Socket, data: &[u8]) -> TlsStatus {
        if self.conn.is_handshaking() {
            match self.handshake(socket) {
                TlsStatus::Done(_) => {}
                other => return other,
            }
        }

        let n = match self.conn.writer().write(data) {
            Ok(n) => n,
            Err(err) => return TlsStatus::Closed(Some(err)),
        };

        match self.flush_records(socket) {
            Err(err) => TlsStatus::Closed(Some(err)),
            Ok(_) if n == 0 && !data.is_empty() => TlsStatus::Want(Direction::Write),
            Ok(_) => TlsStatus::Done(n),
        }
    }

    /// Writes queued records without adding application data.
    pub fn flush(&mut self, socket: &Socket) -> TlsStatus {
        match self.flush_records(socket) {
            Ok(true) => TlsStatus::Done(0),
            Ok(false) => TlsStatus::Want(Direction::Write),
            Err(err) => TlsStatus::Closed(Some(err)),
        }
    }

    /// Queues a `close_notify` alert and makes one attempt to send it.
    pub fn close(&mut self, socket: &Socket) {
        self.conn.send_close_notify();
        let _ = self.flush_records(socket);
    }

    /// Writes queued records until drained (`Ok(true)`) or the socket would
    /// block (`Ok(false)`).
    fn flush_records(&mut self, socket: &Socket) -> io::Result<bool> {
        let mut transport = socket;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut transport) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(err) if is_transient(&err) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    fn fill(&mut self, socket: &Socket) -> io::Result<Fill> {
        let mut transport = socket;
        match self.conn.read_tls(&mut transport) {
            Ok(0) => Ok(Fill::Eof),
            Ok(_) => match self.conn.process_new_packets() {
                Ok(_) => Ok(Fill::Records),
                Err(err) => {
                    // Give the alert describing the failure a chance to leave.
                    let _ = self.flush_records(socket);
                    Err(io::Error::new(io::ErrorKind::InvalidData, err))
                }
            },
            Err(err) if is_transient(&err) => Ok(Fill::Empty),
            Err(err) => Err(err),
        }
    }
}

/// Builds a server configuration from PEM certificate and key files.
pub fn load_server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&files.cert_path)?;
    let key = load_key(&files.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| Error::Certificate {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Certificate {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    if certs.is_empty() {
        return Err(Error::Certificate {
            path: path.to_path_buf(),
            reason: "no certificates found".into(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| Error::Certificate {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
        .ok_or_else(|| Error::Certificate {
            path: path.to_path_buf(),
            reason: "no private key found".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    const STATES: [Redirect; 3] = [
        Redirect::Normal,
        Redirect::WriteRedirectedForRead,
        Redirect::ReadRedirectedForWrite,
    ];

    const INTERESTS: [Interest; 4] = [
        Interest::NONE,
        Interest::READ,
        Interest::WRITE,
        Interest::BOTH,
    ];

    fn readiness_edges() -> [Readiness; 4] {
        [
            Readiness::default(),
            Readiness {
                readable: true,
                writable: false,
            },
            Readiness {
                readable: false,
                writable: true,
            },
            Readiness {
                readable: true,
                writable: true,
            },
        ]
    }

    #[test]
    fn normal_passes_through() {
        for wanted in INTERESTS {
            assert_eq!(Redirect::Normal.interest(wanted), wanted);
        }
        for observed in readiness_edges() {
            assert_eq!(Redirect::Normal.readiness(observed), observed);
        }
    }

    #[test]
    fn redirected_interest_never_asks_for_suppressed_direction() {
        for wanted in INTERESTS {
            let any = wanted.read || wanted.write;

            let interest = Redirect::WriteRedirectedForRead.interest(wanted);
            assert!(!interest.write, "{wanted:?}");
            assert_eq!(interest.read, any, "{wanted:?}");

            let interest = Redirect::ReadRedirectedForWrite.interest(wanted);
            assert!(!interest.read, "{wanted:?}");
            assert_eq!(interest.write, any, "{wanted:?}");
        }
    }

    #[test]
    fn redirected_readiness_follows_os_direction() {
        for observed in readiness_edges() {
            let r = Redirect::WriteRedirectedForRead.readiness(observed);
            assert_eq!(r.writable, observed.readable, "{observed:?}");
            assert_eq!(r.readable, observed.readable, "{observed:?}");

            let r = Redirect::ReadRedirectedForWrite.readiness(observed);
            assert_eq!(r.readable, observed.writable, "{observed:?}");
            assert_eq!(r.writable, observed.writable, "{observed:?}");
        }
    }

    #[test]
    fn redirected_write_wakes_on_read_edge_only() {
        // Owner wants to write; only an OS read edge may let it retry.
        let state = Redirect::WriteRedirectedForRead;
        let registered = state.interest(Interest::WRITE);
        assert_eq!(registered, Interest::READ);

        for observed in readiness_edges() {
            let seen = state.readiness(observed);
            assert_eq!(seen.writable, observed.readable);
        }
    }

    #[test]
    fn transitions_after_read() {
        for state in STATES {
            assert_eq!(
                state.after_read(&TlsStatus::Want(Direction::Write)),
                Redirect::ReadRedirectedForWrite
            );
            assert_eq!(state.after_read(&TlsStatus::Done(3)), Redirect::Normal);
            assert_eq!(state.after_read(&TlsStatus::Closed(None)), Redirect::Normal);
        }
        assert_eq!(
            Redirect::Normal.after_read(&TlsStatus::Want(Direction::Read)),
            Redirect::Normal
        );
        // A read that merely found nothing does not satisfy a stalled write.
        assert_eq!(
            Redirect::WriteRedirectedForRead.after_read(&TlsStatus::Want(Direction::Read)),
            Redirect::WriteRedirectedForRead
        );
        assert_eq!(
            Redirect::ReadRedirectedForWrite.after_read(&TlsStatus::Want(Direction::Read)),
            Redirect::Normal
        );
    }

    #[test]
    fn transitions_after_write() {
        for state in STATES {
            assert_eq!(
                state.after_write(&TlsStatus::Want(Direction::Read)),
                Redirect::WriteRedirectedForRead
            );
            assert_eq!(state.after_write(&TlsStatus::Done(0)), Redirect::Normal);
            assert_eq!(state.after_write(&TlsStatus::Closed(None)), Redirect::Normal);
        }
        assert_eq!(
            Redirect::Normal.after_write(&TlsStatus::Want(Direction::Write)),
            Redirect::Normal
        );
        assert_eq!(
            Redirect::ReadRedirectedForWrite.after_write(&TlsStatus::Want(Direction::Write)),
            Redirect::ReadRedirectedForWrite
        );
        assert_eq!(
            Redirect::WriteRedirectedForRead.after_write(&TlsStatus::Want(Direction::Write)),
            Redirect::Normal
        );
    }

    #[test]
    fn missing_certificate_reported_with_path() {
        let files = TlsFiles {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        match load_server_config(&files) {
            Err(Error::Certificate { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/cert.pem"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_certificate_file_rejected() {
        let dir = std::env::temp_dir().join(format!("tcpnet-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "").unwrap();

        let files = TlsFiles {
            cert_path: cert.clone(),
            key_path: cert.clone(),
        };
        let result = load_server_config(&files);
        let _ = std::fs::remove_dir_all(&dir);

        assert!(matches!(result, Err(Error::Certificate { reason, .. }) if reason == "no certificates found"));
    }

    #[test]
    fn client_rejects_invalid_server_name() {
        let config = ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        assert!(TlsSession::client(Arc::new(config.clone()), "not a host name!").is_err());

        let session = TlsSession::client(Arc::new(config), "example.com").unwrap();
        assert!(session.is_handshaking());
        assert!(session.has_pending_output());
        assert_eq!(session.redirect(), Redirect::Normal);
    }
}
